//! Entry events fired on the partition owner after a replicated write.

use std::sync::Arc;

use parking_lot::RwLock;
use relaygrid_core::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEventType {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryEvent {
    pub map_name: String,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub event_type: EntryEventType,
    /// Member that issued the write.
    pub origin: String,
}

impl EntryEvent {
    /// Event for a put, typed by whether a live value was replaced.
    #[must_use]
    pub fn for_put(
        map_name: &str,
        key: &str,
        old_value: Option<Value>,
        new_value: Value,
        origin: &str,
    ) -> Self {
        let event_type = if old_value.is_some() {
            EntryEventType::Updated
        } else {
            EntryEventType::Added
        };
        Self {
            map_name: map_name.to_string(),
            key: key.to_string(),
            old_value,
            new_value: Some(new_value),
            event_type,
            origin: origin.to_string(),
        }
    }
}

/// Receives entry events. Used as `Arc<dyn EntryListener>`.
///
/// Called on a partition lane; implementations must not block.
pub trait EntryListener: Send + Sync {
    fn on_entry(&self, event: &EntryEvent);
}

/// Fans events out to every registered listener.
#[derive(Default)]
pub struct EventPublisher {
    listeners: RwLock<Vec<Arc<dyn EntryListener>>>,
}

impl EventPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn EntryListener>) {
        self.listeners.write().push(listener);
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn publish(&self, event: &EntryEvent) {
        for listener in self.listeners.read().iter() {
            listener.on_entry(event);
        }
    }
}
