//! Packets exchanged between members.

use bytes::Bytes;

/// Unit of member-to-member traffic.
///
/// Operations and responses travel as encoded bytes; see
/// [`OperationCodec`](crate::service::codec::OperationCodec).
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// An encoded operation. `call_id == 0` marks fire-and-forget traffic.
    /// `attempt` numbers the retries of one call, starting at 0.
    Request {
        call_id: u64,
        attempt: u32,
        caller: String,
        operation: Bytes,
    },
    /// An encoded response envelope for attempt `attempt` of `call_id`.
    Response {
        call_id: u64,
        attempt: u32,
        response: Bytes,
    },
    /// A synchronous backup acknowledgment for attempt `attempt` of `call_id`.
    BackupAck { call_id: u64, attempt: u32 },
}

impl Packet {
    #[must_use]
    pub fn call_id(&self) -> u64 {
        match self {
            Packet::Request { call_id, .. }
            | Packet::Response { call_id, .. }
            | Packet::BackupAck { call_id, .. } => *call_id,
        }
    }
}

/// A packet together with the member that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    pub from: String,
    pub packet: Packet,
}
