//! Cluster ownership model.
//!
//! Membership discovery is an external collaborator; this module holds the
//! snapshot it produces (members, partition owners and backups) and the
//! [`PartitionService`] contract the dispatcher resolves targets through.

pub mod assignment;
pub mod state;
pub mod traits;
pub mod types;

pub use assignment::compute_assignment;
pub use state::ClusterPartitionTable;
pub use traits::PartitionService;
pub use types::{MemberInfo, NodeState, PartitionAssignment, PartitionMeta, PartitionState};
