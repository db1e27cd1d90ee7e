//! Partition ownership contract used by dispatch and protocols.

use relaygrid_core::partition_for_key;

/// Read-side view of the partition table.
///
/// The dispatcher resolves owners through this trait on every attempt, so an
/// implementation must reflect ownership changes as soon as they are applied.
pub trait PartitionService: Send + Sync {
    /// Total number of partitions.
    fn partition_count(&self) -> u32;

    /// Maps a key to its partition.
    fn partition_id(&self, key: &str) -> u32 {
        partition_for_key(key, self.partition_count())
    }

    /// Returns the current owner of a partition, if assigned.
    fn owner(&self, partition_id: u32) -> Option<String>;

    /// Returns the backup replicas of a partition in replica-index order.
    fn backups(&self, partition_id: u32) -> Vec<String>;

    /// Monotonic version of the ownership table.
    fn version(&self) -> u64;
}
