//! Executing side of the framework: turns inbound packets into lane work and
//! lane results into response packets.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::codec::OperationCodec;
use super::dispatch::OperationService;
use super::invocation::InvocationError;
use super::lanes::{LaneResult, PartitionLanes};
use super::operation::{OperationError, RemoteFailure, ResponseEnvelope};
use crate::cluster::PartitionService;
use crate::network::{InboundPacket, Packet, Transport};

/// Decodes requests, checks ownership and feeds partition lanes.
pub struct OperationExecutor {
    node_id: String,
    codec: Arc<OperationCodec>,
    partitions: Arc<dyn PartitionService>,
    transport: Arc<dyn Transport>,
    operations: Arc<OperationService>,
    lanes: PartitionLanes,
}

impl OperationExecutor {
    #[must_use]
    pub fn new(
        codec: Arc<OperationCodec>,
        partitions: Arc<dyn PartitionService>,
        transport: Arc<dyn Transport>,
        operations: Arc<OperationService>,
        lanes: PartitionLanes,
    ) -> Self {
        Self {
            node_id: operations.node_id().to_string(),
            codec,
            partitions,
            transport,
            operations,
            lanes,
        }
    }

    /// Consumes `inbound` until the queue closes, handling packets in order.
    pub fn spawn_inbound(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundPacket>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(packet) = inbound.recv().await {
                self.handle_packet(packet);
            }
            debug!(node_id = %self.node_id, "inbound queue closed");
        })
    }

    /// Handles one packet without waiting on lanes or peers, so responses
    /// and backup acks are never stuck behind queued requests.
    pub fn handle_packet(&self, inbound: InboundPacket) {
        let InboundPacket { from, packet } = inbound;
        match packet {
            Packet::Request {
                call_id,
                attempt,
                caller,
                operation,
            } => self.handle_request(call_id, attempt, caller, operation),
            Packet::Response {
                call_id,
                attempt,
                response,
            } => match OperationCodec::decode_response(response) {
                Ok(envelope) => {
                    if self
                        .operations
                        .notify_response(call_id, attempt, envelope)
                        .is_err()
                    {
                        trace!(call_id, from = %from, "late response ignored");
                    }
                }
                Err(err) => {
                    warn!(call_id, from = %from, error = %err, "undecodable response");
                    let _ = self
                        .operations
                        .registry()
                        .complete(call_id, Err(InvocationError::Codec(err.to_string())));
                }
            },
            Packet::BackupAck { call_id, attempt } => {
                if self.operations.notify_backup_ack(call_id, attempt).is_err() {
                    trace!(call_id, from = %from, "late backup ack ignored");
                }
            }
        }
    }

    fn handle_request(&self, call_id: u64, attempt: u32, caller: String, bytes: Bytes) {
        let reply = Reply {
            transport: Arc::clone(&self.transport),
            call_id,
            attempt,
            caller,
        };
        let mut op = match self.codec.decode(bytes) {
            Ok(op) => op,
            Err(err) => {
                warn!(call_id, caller = %reply.caller, error = %err, "undecodable operation");
                reply.send(Err(OperationError::Codec(err)));
                return;
            }
        };
        {
            let ctx = op.ctx_mut();
            ctx.call_id = call_id;
            ctx.attempt = attempt;
            ctx.caller.clone_from(&reply.caller);
        }

        let partition_id = op.partition_id();
        if op.kind().is_owner_targeted()
            && self.partitions.owner(partition_id).as_deref() != Some(self.node_id.as_str())
        {
            debug!(call_id, partition_id, caller = %reply.caller, "rejecting operation for foreign partition");
            reply.send(Err(OperationError::WrongTarget {
                partition_id,
                node_id: self.node_id.clone(),
            }));
            return;
        }

        match self.lanes.try_submit(op) {
            Ok(rx) => {
                tokio::spawn(async move {
                    let result: LaneResult = rx.await.unwrap_or_else(|_| {
                        Err(OperationError::Internal(anyhow::anyhow!(
                            "lane dropped operation"
                        )))
                    });
                    reply.deliver(result).await;
                });
            }
            Err(err) => {
                warn!(call_id, partition_id, error = %err, "lane rejected operation");
                reply.send(Err(err));
            }
        }
    }

    /// Stops all lanes after their queues drain.
    pub async fn stop(&mut self) {
        self.lanes.stop().await;
    }
}

/// Where the result of one request goes.
struct Reply {
    transport: Arc<dyn Transport>,
    call_id: u64,
    attempt: u32,
    caller: String,
}

impl Reply {
    /// Delivers `result` from a spawned task.
    fn send(self, result: LaneResult) {
        tokio::spawn(self.deliver(result));
    }

    /// Sends `result` back to the caller. Fire-and-forget requests get no
    /// response; their failures are only logged.
    async fn deliver(self, result: LaneResult) {
        let Reply {
            transport,
            call_id,
            attempt,
            caller,
        } = self;
        let envelope = ResponseEnvelope::from_result(result);
        if call_id == 0 {
            if let Err(failure) = &envelope.outcome {
                debug!(caller = %caller, error = %failure, "one-way operation failed");
            }
            return;
        }

        let response = match OperationCodec::encode_response(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(call_id, error = %err, "response encoding failed");
                let fallback = ResponseEnvelope::failure(RemoteFailure::Codec {
                    message: err.to_string(),
                });
                match OperationCodec::encode_response(&fallback) {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                }
            }
        };

        let packet = Packet::Response {
            call_id,
            attempt,
            response,
        };
        if let Err(err) = transport.send(&caller, packet).await {
            // The caller retries or times out on its own.
            warn!(call_id, caller = %caller, error = %err, "response not delivered");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
