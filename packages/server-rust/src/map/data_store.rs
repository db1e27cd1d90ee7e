//! Persistence backend written to by map flushes.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use relaygrid_core::Value;

/// External persistence for partitioned maps.
///
/// Used as `Arc<dyn MapDataStore>`.
#[async_trait]
pub trait MapDataStore: Send + Sync {
    /// Persists a batch of entries of `map`.
    async fn store_all(&self, map: &str, entries: &[(String, Value)]) -> anyhow::Result<()>;

    /// Whether this is a no-op implementation.
    fn is_null(&self) -> bool {
        false
    }
}

/// Discards every write. The default when no backend is configured.
pub struct NullDataStore;

#[async_trait]
impl MapDataStore for NullDataStore {
    async fn store_all(&self, _map: &str, _entries: &[(String, Value)]) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_null(&self) -> bool {
        true
    }
}

/// Keeps persisted entries in memory so they can be inspected.
#[derive(Default)]
pub struct InMemoryDataStore {
    maps: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    batches: Mutex<usize>,
}

impl InMemoryDataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted contents of `map`, ordered by key.
    #[must_use]
    pub fn entries(&self, map: &str) -> BTreeMap<String, Value> {
        self.maps.lock().get(map).cloned().unwrap_or_default()
    }

    /// Number of `store_all` batches received.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        *self.batches.lock()
    }
}

#[async_trait]
impl MapDataStore for InMemoryDataStore {
    async fn store_all(&self, map: &str, entries: &[(String, Value)]) -> anyhow::Result<()> {
        let mut maps = self.maps.lock();
        let stored = maps.entry(map.to_string()).or_default();
        for (key, value) in entries {
            stored.insert(key.clone(), value.clone());
        }
        *self.batches.lock() += 1;
        Ok(())
    }
}
