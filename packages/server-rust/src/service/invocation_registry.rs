//! Concurrent table of outstanding invocations keyed by call id.

use std::sync::Arc;

use dashmap::DashMap;

use super::invocation::{Invocation, InvocationResult};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("call id {0} is already registered")]
    DuplicateCallId(u64),
    #[error("call id {0} is not registered")]
    NotFound(u64),
}

/// Outstanding invocations on this member.
///
/// Iteration is lazy and tolerates concurrent inserts and removals. Callers
/// that need to remove entries while scanning must collect first: a live
/// iterator holds shard read guards and removing from the same shard would
/// block.
#[derive(Default)]
pub struct InvocationRegistry {
    invocations: DashMap<u64, Arc<Invocation>>,
}

impl InvocationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an invocation under its call id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateCallId`] if the id is taken.
    pub fn register(&self, invocation: Arc<Invocation>) -> Result<(), RegistryError> {
        let call_id = invocation.call_id();
        match self.invocations.entry(call_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::DuplicateCallId(call_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(invocation);
                Ok(())
            }
        }
    }

    /// Removes the entry and delivers `result` to its caller.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the call already finished or was
    /// never registered; the result is dropped.
    pub fn complete(&self, call_id: u64, result: InvocationResult) -> Result<(), RegistryError> {
        let invocation = self
            .deregister(call_id)
            .ok_or(RegistryError::NotFound(call_id))?;
        invocation.complete(result);
        Ok(())
    }

    /// Removes the entry if present. Calling it twice is harmless.
    pub fn deregister(&self, call_id: u64) -> Option<Arc<Invocation>> {
        self.invocations.remove(&call_id).map(|(_, inv)| inv)
    }

    #[must_use]
    pub fn get(&self, call_id: u64) -> Option<Arc<Invocation>> {
        self.invocations.get(&call_id).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn contains(&self, call_id: u64) -> bool {
        self.invocations.contains_key(&call_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.invocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }

    /// Lazily yields every registered invocation.
    pub fn iter(&self) -> impl Iterator<Item = Arc<Invocation>> + '_ {
        self.invocations.iter().map(|e| Arc::clone(e.value()))
    }

    /// Call ids currently registered, in no particular order.
    #[must_use]
    pub fn call_ids(&self) -> Vec<u64> {
        self.invocations.iter().map(|e| *e.key()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
