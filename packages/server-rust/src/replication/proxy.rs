//! Caller-facing handle for one replicated map.

use std::sync::Arc;

use relaygrid_core::Value;

use crate::service::dispatch::OperationService;
use crate::service::invocation::InvocationError;
use crate::service::operation::{
    EntryPayload, KeyPayload, Operation, OperationContext, OperationResponse,
};

/// Previous value and the version now stored by the partition owner.
#[derive(Debug, Clone, PartialEq)]
pub struct PutResult {
    pub old_value: Option<Value>,
    pub version: u64,
}

#[derive(Clone)]
pub struct ReplicatedMapProxy {
    name: String,
    operations: Arc<OperationService>,
}

impl ReplicatedMapProxy {
    #[must_use]
    pub fn new(name: impl Into<String>, operations: Arc<OperationService>) -> Self {
        Self {
            name: name.into(),
            operations,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes `key` without expiry.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`InvocationError`] of the underlying call.
    pub async fn put(&self, key: &str, value: Value) -> Result<PutResult, InvocationError> {
        self.put_with_ttl(key, value, 0).await
    }

    /// Writes `key`, expiring it `ttl_millis` after the owner applies it.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`InvocationError`] of the underlying call, or
    /// [`InvocationError::Application`] for a null value.
    pub async fn put_with_ttl(
        &self,
        key: &str,
        value: Value,
        ttl_millis: i64,
    ) -> Result<PutResult, InvocationError> {
        let op = Operation::Put {
            ctx: self.context(key),
            entry: EntryPayload {
                name: self.name.clone(),
                key: key.to_string(),
                value,
                ttl_millis,
            },
        };
        versioned(self.operations.invoke(op).await?)
    }

    /// Reads `key` from its partition owner.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`InvocationError`] of the underlying call.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, InvocationError> {
        let op = Operation::Get {
            ctx: self.context(key),
            target: self.target(key),
        };
        match self.operations.invoke(op).await? {
            OperationResponse::Value(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    /// Removes `key`. A missing key reports no old value and its current
    /// version.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`InvocationError`] of the underlying call.
    pub async fn remove(&self, key: &str) -> Result<PutResult, InvocationError> {
        let op = Operation::Remove {
            ctx: self.context(key),
            target: self.target(key),
        };
        versioned(self.operations.invoke(op).await?)
    }

    fn context(&self, key: &str) -> OperationContext {
        OperationContext::new(self.operations.partitions().partition_id(key), 0)
    }

    fn target(&self, key: &str) -> KeyPayload {
        KeyPayload {
            name: self.name.clone(),
            key: key.to_string(),
        }
    }
}

fn versioned(response: OperationResponse) -> Result<PutResult, InvocationError> {
    match response {
        OperationResponse::Versioned { old_value, version } => Ok(PutResult { old_value, version }),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &OperationResponse) -> InvocationError {
    InvocationError::Internal(format!("unexpected response: {response:?}"))
}
