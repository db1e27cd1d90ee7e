//! Key-to-partition mapping.
//!
//! Every key maps deterministically to exactly one partition:
//! `fnv1a(key) % partition_count`. The default partition count is 271, a prime
//! chosen for uniform modulo distribution.

use crate::hash::fnv1a_hash;

/// Default number of partitions in a cluster.
pub const PARTITION_COUNT: u32 = 271;

/// Partition identifier, dense in `[0, partition_count)`.
pub type PartitionId = u32;

/// Computes the partition id of `key` using the default partition count.
///
/// # Examples
///
/// ```
/// use relaygrid_core::partition::hash_to_partition;
///
/// assert_eq!(hash_to_partition("hello"), 95);
/// assert_eq!(hash_to_partition("key1"), 268);
/// ```
#[must_use]
pub fn hash_to_partition(key: &str) -> PartitionId {
    partition_for_key(key, PARTITION_COUNT)
}

/// Computes the partition id of `key` for an explicit partition count.
///
/// A `partition_count` of zero is treated as one so the function is total.
#[must_use]
pub fn partition_for_key(key: &str, partition_count: u32) -> PartitionId {
    fnv1a_hash(key) % partition_count.max(1)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_count_vectors() {
        assert_eq!(hash_to_partition("hello"), 95);
        assert_eq!(hash_to_partition("key1"), 268);
    }

    #[test]
    fn zero_count_maps_everything_to_zero() {
        assert_eq!(partition_for_key("anything", 0), 0);
    }

    #[test]
    fn explicit_count_matches_default() {
        assert_eq!(
            partition_for_key("user:42", PARTITION_COUNT),
            hash_to_partition("user:42")
        );
    }

    proptest! {
        #[test]
        fn always_in_range(key in ".*", count in 1u32..2048) {
            prop_assert!(partition_for_key(&key, count) < count);
        }

        #[test]
        fn deterministic(key in ".*") {
            prop_assert_eq!(hash_to_partition(&key), hash_to_partition(&key));
        }
    }
}
