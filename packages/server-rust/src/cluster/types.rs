//! Cluster domain types consumed by the invocation layer.
//!
//! Membership discovery lives outside this crate; these types describe the
//! snapshot it hands over: who is a member and who owns which partition.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a cluster member as reported by membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    Joining,
    Active,
    Leaving,
    Dead,
}

/// State of a partition in the ownership table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartitionState {
    Active,
    /// Ownership is being handed over; operations may be bounced with a
    /// wrong-target failure and retried by the caller.
    Migrating,
}

/// A single cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub node_id: String,
    pub state: NodeState,
}

impl MemberInfo {
    /// Convenience constructor for an active member.
    #[must_use]
    pub fn active(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: NodeState::Active,
        }
    }
}

/// Ownership metadata for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMeta {
    pub partition_id: u32,
    pub owner: String,
    /// Backup replicas in replica-index order (first backup first).
    pub backups: Vec<String>,
    pub state: PartitionState,
}

/// Target assignment for a partition (output of the assignment algorithm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionAssignment {
    pub partition_id: u32,
    pub owner: String,
    pub backups: Vec<String>,
}
