//! Deterministic partition assignment.

use super::types::{MemberInfo, NodeState, PartitionAssignment};

/// Computes a deterministic partition assignment for the given active members.
///
/// Uses modulo-based distribution over members sorted by `node_id`. Backup
/// replicas are the next `backup_count` members after the owner (wrapping),
/// never the owner itself.
///
/// Returns an empty Vec if no active members exist.
#[must_use]
pub fn compute_assignment(
    members: &[MemberInfo],
    partition_count: u32,
    backup_count: u32,
) -> Vec<PartitionAssignment> {
    let mut active: Vec<&MemberInfo> = members
        .iter()
        .filter(|m| m.state == NodeState::Active)
        .collect();
    active.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    let n = active.len();
    if n == 0 {
        return Vec::new();
    }
    let backups_per_partition = (backup_count as usize).min(n - 1);

    (0..partition_count)
        .map(|pid| {
            let owner_idx = (pid as usize) % n;
            let backups = (1..=backups_per_partition)
                .map(|i| active[(owner_idx + i) % n].node_id.clone())
                .collect();
            PartitionAssignment {
                partition_id: pid,
                owner: active[owner_idx].node_id.clone(),
                backups,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
