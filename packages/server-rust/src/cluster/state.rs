//! Shared partition ownership table.
//!
//! `ClusterPartitionTable` keeps per-partition metadata in a `DashMap` so that
//! readers of one partition never block writers of another, and an `AtomicU64`
//! version that advances on every ownership change.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::traits::PartitionService;
use super::types::{PartitionAssignment, PartitionMeta, PartitionState};

/// Concurrent partition table tracking per-partition ownership and state.
pub struct ClusterPartitionTable {
    partitions: DashMap<u32, PartitionMeta>,
    version: AtomicU64,
    partition_count: u32,
}

impl fmt::Debug for ClusterPartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterPartitionTable")
            .field("partition_count", &self.partition_count)
            .field("version", &self.version.load(Ordering::Relaxed))
            .field("populated", &self.partitions.len())
            .finish()
    }
}

impl ClusterPartitionTable {
    /// Creates an empty partition table with the given total partition count.
    #[must_use]
    pub fn new(partition_count: u32) -> Self {
        Self {
            partitions: DashMap::new(),
            version: AtomicU64::new(0),
            partition_count,
        }
    }

    /// Returns a clone of the metadata for the given partition, if it exists.
    #[must_use]
    pub fn get_partition(&self, partition_id: u32) -> Option<PartitionMeta> {
        self.partitions.get(&partition_id).map(|r| r.clone())
    }

    /// Updates or inserts partition ownership without bumping the version.
    pub fn set_owner(&self, partition_id: u32, owner: String, backups: Vec<String>) {
        match self.partitions.get_mut(&partition_id) {
            Some(mut entry) => {
                entry.owner = owner;
                entry.backups = backups;
            }
            None => {
                self.partitions.insert(
                    partition_id,
                    PartitionMeta {
                        partition_id,
                        owner,
                        backups,
                        state: PartitionState::Active,
                    },
                );
            }
        }
    }

    /// Updates the state of an existing partition.
    pub fn set_state(&self, partition_id: u32, state: PartitionState) {
        if let Some(mut entry) = self.partitions.get_mut(&partition_id) {
            entry.state = state;
        }
    }

    /// Atomically increments the version and returns the new value.
    ///
    /// Uses `Release` ordering so that all prior partition mutations are
    /// visible to readers that observe the new version via `Acquire`.
    pub fn increment_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Release) + 1
    }

    /// Bulk-applies partition assignments and increments the table version.
    pub fn apply_assignments(&self, assignments: &[PartitionAssignment]) {
        for a in assignments {
            self.set_owner(a.partition_id, a.owner.clone(), a.backups.clone());
        }
        self.increment_version();
    }

    /// Moves ownership of one partition to `new_owner`.
    ///
    /// The previous owner is removed from the backup list if present and
    /// pushed to its front, mirroring a promotion swap. Returns the previous
    /// owner, or `None` if the partition was unassigned.
    pub fn transfer_ownership(&self, partition_id: u32, new_owner: &str) -> Option<String> {
        let previous = {
            let mut entry = self.partitions.get_mut(&partition_id)?;
            let previous = std::mem::replace(&mut entry.owner, new_owner.to_string());
            entry.backups.retain(|b| b != new_owner);
            if previous != new_owner {
                entry.backups.insert(0, previous.clone());
            }
            previous
        };
        self.increment_version();
        Some(previous)
    }

    /// Returns all partition IDs owned by the given node, sorted.
    #[must_use]
    pub fn partitions_for_node(&self, node_id: &str) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .partitions
            .iter()
            .filter(|entry| entry.value().owner == node_id)
            .map(|entry| *entry.key())
            .collect();
        pids.sort_unstable();
        pids
    }
}

impl PartitionService for ClusterPartitionTable {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn owner(&self, partition_id: u32) -> Option<String> {
        self.partitions
            .get(&partition_id)
            .filter(|meta| meta.state == PartitionState::Active)
            .map(|meta| meta.owner.clone())
    }

    fn backups(&self, partition_id: u32) -> Vec<String> {
        self.partitions
            .get(&partition_id)
            .map(|meta| meta.backups.clone())
            .unwrap_or_default()
    }

    /// Uses `Acquire` ordering to pair with the `Release` in
    /// [`ClusterPartitionTable::increment_version`].
    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
