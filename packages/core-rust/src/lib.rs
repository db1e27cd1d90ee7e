//! `RelayGrid` Core: key hashing, partition mapping, and the value model.

pub mod hash;
pub mod partition;
pub mod types;

pub use partition::{hash_to_partition, partition_for_key, PartitionId, PARTITION_COUNT};
pub use types::{Value, ValueError};
