//! In-process network connecting members through bounded channels.
//!
//! Every member that joins gets an inbound `mpsc` queue. Link faults can be
//! injected per target member to simulate crashes and partitions.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use super::packet::{InboundPacket, Packet};
use super::transport::{Transport, TransportError};

/// Default capacity of each member's inbound queue.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Fault applied to all packets addressed to a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Sends fail immediately with [`TransportError::Unreachable`].
    Unreachable,
    /// Sends succeed but packets are silently dropped.
    BlackHole,
}

/// Registry of members reachable in this process.
pub struct LocalNetwork {
    endpoints: DashMap<String, mpsc::Sender<InboundPacket>>,
    faults: DashMap<String, LinkFault>,
    capacity: usize,
}

impl LocalNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_INBOUND_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            faults: DashMap::new(),
            capacity: capacity.max(1),
        })
    }

    /// Attaches `node_id`, returning its transport and inbound queue.
    ///
    /// Joining again under the same id replaces the previous queue.
    pub fn join(
        self: &Arc<Self>,
        node_id: &str,
    ) -> (Arc<LocalTransport>, mpsc::Receiver<InboundPacket>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.endpoints.insert(node_id.to_string(), tx);
        let transport = Arc::new(LocalTransport {
            node_id: node_id.to_string(),
            network: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Detaches `node_id`. Later sends to it fail as unreachable.
    pub fn leave(&self, node_id: &str) {
        self.endpoints.remove(node_id);
    }

    pub fn set_fault(&self, node_id: &str, fault: LinkFault) {
        self.faults.insert(node_id.to_string(), fault);
    }

    pub fn clear_fault(&self, node_id: &str) {
        self.faults.remove(node_id);
    }

    #[must_use]
    pub fn is_joined(&self, node_id: &str) -> bool {
        self.endpoints.contains_key(node_id)
    }

    async fn deliver(&self, from: &str, target: &str, packet: Packet) -> Result<(), TransportError> {
        let fault = self.faults.get(target).map(|f| *f);
        match fault {
            Some(LinkFault::Unreachable) => {
                return Err(TransportError::Unreachable {
                    node_id: target.to_string(),
                })
            }
            Some(LinkFault::BlackHole) => {
                trace!(from, target, call_id = packet.call_id(), "packet dropped");
                return Ok(());
            }
            None => {}
        }

        // Clone the sender so no map guard is held across the await.
        let tx = self
            .endpoints
            .get(target)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::Unreachable {
                node_id: target.to_string(),
            })?;

        tx.send(InboundPacket {
            from: from.to_string(),
            packet,
        })
        .await
        .map_err(|_| TransportError::Closed {
            node_id: target.to_string(),
        })
    }
}

/// Transport handle of one member on a [`LocalNetwork`].
pub struct LocalTransport {
    node_id: String,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node_id(&self) -> &str {
        &self.node_id
    }

    async fn send(&self, target: &str, packet: Packet) -> Result<(), TransportError> {
        self.network.deliver(&self.node_id, target, packet).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
