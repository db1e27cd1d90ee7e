//! Per-partition map records with dirty tracking for flushes.

use std::collections::HashMap;

use parking_lot::Mutex;
use relaygrid_core::Value;

#[derive(Debug, Clone)]
struct MapRecord {
    value: Value,
    /// Bumped on every write; lets a flush clear only what it persisted.
    seq: u64,
    dirty: bool,
}

/// Entry selected for a flush, with the write sequence it captured.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushCandidate {
    pub key: String,
    pub value: Value,
    pub seq: u64,
}

pub struct MapRecordStore {
    name: String,
    partition_id: u32,
    records: Mutex<HashMap<String, MapRecord>>,
}

impl MapRecordStore {
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

    /// Owner write; the record becomes dirty. Returns the previous value.
    pub fn put(&self, key: &str, value: Value) -> Option<Value> {
        self.write(key, value, true)
    }

    /// Backup write. Backups never flush, so the record stays clean.
    pub fn put_backup(&self, key: &str, value: Value) -> Option<Value> {
        self.write(key, value, false)
    }

    fn write(&self, key: &str, value: Value, dirty: bool) -> Option<Value> {
        let mut records = self.records.lock();
        let seq = records.get(key).map_or(1, |r| r.seq + 1);
        records
            .insert(key.to_string(), MapRecord { value, seq, dirty })
            .map(|old| old.value)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.records.lock().get(key).map(|r| r.value.clone())
    }

    #[must_use]
    pub fn is_dirty(&self, key: &str) -> bool {
        self.records.lock().get(key).is_some_and(|r| r.dirty)
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.records.lock().values().filter(|r| r.dirty).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records to persist: dirty ones, or every record when `flush_all`.
    /// Sorted by key.
    #[must_use]
    pub fn flush_candidates(&self, flush_all: bool) -> Vec<FlushCandidate> {
        let mut candidates: Vec<FlushCandidate> = self
            .records
            .lock()
            .iter()
            .filter(|(_, r)| flush_all || r.dirty)
            .map(|(key, r)| FlushCandidate {
                key: key.clone(),
                value: r.value.clone(),
                seq: r.seq,
            })
            .collect();
        candidates.sort_by(|a, b| a.key.cmp(&b.key));
        candidates
    }

    /// Clears the dirty flag of each flushed record not rewritten since.
    pub fn mark_clean(&self, flushed: &[FlushCandidate]) {
        let mut records = self.records.lock();
        for candidate in flushed {
            if let Some(record) = records.get_mut(&candidate.key) {
                if record.seq == candidate.seq {
                    record.dirty = false;
                }
            }
        }
    }
}
