//! Member-to-member packet transport.

pub mod local;
pub mod packet;
pub mod transport;

pub use local::{LinkFault, LocalNetwork, LocalTransport};
pub use packet::{InboundPacket, Packet};
pub use transport::{Transport, TransportError};
