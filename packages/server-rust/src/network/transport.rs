//! Member-to-member transport contract.

use async_trait::async_trait;

use super::packet::Packet;

/// Errors raised when a packet cannot be handed to its target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("member {node_id} is unreachable")]
    Unreachable { node_id: String },
    #[error("inbound queue of member {node_id} is closed")]
    Closed { node_id: String },
}

/// Delivers packets to members by node id.
///
/// A successful `send` only means the packet was handed off; delivery is not
/// acknowledged. Sends addressed to the local member must loop back into its
/// own inbound queue.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Node id of the member this transport sends from.
    fn local_node_id(&self) -> &str;

    /// Sends `packet` to `target`.
    async fn send(&self, target: &str, packet: Packet) -> Result<(), TransportError>;
}
