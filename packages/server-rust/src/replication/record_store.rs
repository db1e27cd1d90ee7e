//! Versioned record storage for one (map name, partition) pair.
//!
//! Every write on the owner bumps the key's version by one. Replicas apply a
//! record only when its version is strictly greater than the stored one, so
//! duplicated or reordered replication is harmless. Removes leave a tombstone
//! that keeps the version alive.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use relaygrid_core::Value;
use tokio::time::Instant;

/// Stored state of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    /// `None` marks a tombstone.
    pub value: Option<Value>,
    pub version: u64,
    /// Zero or negative means the entry never expires.
    pub ttl_millis: i64,
    pub updated_at: Instant,
}

impl VersionedValue {
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        match u64::try_from(self.ttl_millis) {
            Ok(ttl) if ttl > 0 => now >= self.updated_at + Duration::from_millis(ttl),
            _ => false,
        }
    }

    /// The value visible at `now`, hiding tombstones and expired entries.
    #[must_use]
    pub fn live_value(&self, now: Instant) -> Option<&Value> {
        if self.is_expired(now) {
            None
        } else {
            self.value.as_ref()
        }
    }
}

/// Result of a local write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub old_value: Option<Value>,
    pub version: u64,
}

pub struct ReplicatedRecordStore {
    name: String,
    partition_id: u32,
    records: Mutex<HashMap<String, VersionedValue>>,
}

impl ReplicatedRecordStore {
    #[must_use]
    pub fn new(name: impl Into<String>, partition_id: u32) -> Self {
        Self {
            name: name.into(),
            partition_id,
            records: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Owner-side write. Returns the previous live value and the new version.
    pub fn put(&self, key: &str, value: Value, ttl_millis: i64) -> WriteOutcome {
        let now = Instant::now();
        let mut records = self.records.lock();
        let (old_value, version) = match records.get(key) {
            Some(existing) => (existing.live_value(now).cloned(), existing.version + 1),
            None => (None, 1),
        };
        records.insert(
            key.to_string(),
            VersionedValue {
                value: Some(value),
                version,
                ttl_millis,
                updated_at: now,
            },
        );
        WriteOutcome { old_value, version }
    }

    /// Owner-side remove. Writes a tombstone with the next version; returns
    /// `None` when there is nothing live to remove.
    pub fn remove(&self, key: &str) -> Option<WriteOutcome> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let existing = records.get_mut(key)?;
        let old_value = existing.live_value(now).cloned()?;
        existing.value = None;
        existing.version += 1;
        existing.ttl_millis = 0;
        existing.updated_at = now;
        Some(WriteOutcome {
            old_value: Some(old_value),
            version: existing.version,
        })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        self.records
            .lock()
            .get(key)
            .and_then(|r| r.live_value(now).cloned())
    }

    /// Stored version of `key`, 0 when never written.
    #[must_use]
    pub fn version_of(&self, key: &str) -> u64 {
        self.records.lock().get(key).map_or(0, |r| r.version)
    }

    #[must_use]
    pub fn record(&self, key: &str) -> Option<VersionedValue> {
        self.records.lock().get(key).cloned()
    }

    /// Replica-side write. Applies the record only if `version` is newer than
    /// the stored one; returns whether it was applied.
    pub fn apply_replica(
        &self,
        key: &str,
        value: Option<Value>,
        version: u64,
        ttl_millis: i64,
    ) -> bool {
        let mut records = self.records.lock();
        if records.get(key).is_some_and(|r| r.version >= version) {
            return false;
        }
        records.insert(
            key.to_string(),
            VersionedValue {
                value,
                version,
                ttl_millis,
                updated_at: Instant::now(),
            },
        );
        true
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .values()
            .filter(|r| r.live_value(now).is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
