//! Partition-aware dispatch of invocations with retry and timeout.
//!
//! `OperationService` is the calling side of the framework. It stamps each
//! operation with a fresh call id, registers an [`Invocation`], resolves the
//! target member on every attempt and hands the encoded operation to the
//! transport. Responses, backup acks and caller updates arriving from the
//! network complete invocations through the registry.
//!
//! Retries reuse the call id and number each attempt. A plain successful
//! response from any attempt completes the invocation. Failures, responses
//! that wait on backups, and backup acks only count for the attempt in
//! flight. Responses that arrive after completion find no registry entry and
//! are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::codec::OperationCodec;
use super::config::ServerConfig;
use super::invocation::{
    AttemptFailure, Invocation, InvocationError, InvocationFuture, InvocationResult,
    InvocationState, InvocationTarget,
};
use super::invocation_registry::{InvocationRegistry, RegistryError};
use super::operation::{Operation, OperationResponse, RemoteFailure, ResponseEnvelope};
use crate::cluster::PartitionService;
use crate::network::{Packet, Transport};

/// Outcome of one sweep over the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub timed_out: usize,
    pub retried: usize,
}

/// Calling side of the invocation framework.
pub struct OperationService {
    node_id: String,
    config: Arc<ServerConfig>,
    registry: Arc<InvocationRegistry>,
    partitions: Arc<dyn PartitionService>,
    transport: Arc<dyn Transport>,
    codec: Arc<OperationCodec>,
    next_call_id: AtomicU64,
}

impl OperationService {
    #[must_use]
    pub fn new(
        config: Arc<ServerConfig>,
        partitions: Arc<dyn PartitionService>,
        transport: Arc<dyn Transport>,
        codec: Arc<OperationCodec>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            config,
            registry: Arc::new(InvocationRegistry::new()),
            partitions,
            transport,
            codec,
            // 0 is reserved for fire-and-forget packets.
            next_call_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<InvocationRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn partitions(&self) -> &Arc<dyn PartitionService> {
        &self.partitions
    }

    fn allocate_call_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Starting invocations
    // -----------------------------------------------------------------------

    /// Sends `op` to the owner of its partition, re-resolving the owner on
    /// every attempt.
    pub async fn dispatch(self: &Arc<Self>, op: Operation) -> InvocationFuture {
        self.start(op, InvocationTarget::PartitionOwner).await
    }

    /// Sends `op` to a fixed member.
    pub async fn dispatch_to(self: &Arc<Self>, target: &str, op: Operation) -> InvocationFuture {
        self.start(op, InvocationTarget::Member(target.to_string()))
            .await
    }

    /// Dispatches `op` to its partition owner and waits for the result.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`InvocationError`] of the call.
    pub async fn invoke(self: &Arc<Self>, op: Operation) -> InvocationResult {
        self.dispatch(op).await.await
    }

    async fn start(self: &Arc<Self>, mut op: Operation, mode: InvocationTarget) -> InvocationFuture {
        let call_id = self.allocate_call_id();
        {
            let ctx = op.ctx_mut();
            ctx.call_id = call_id;
            ctx.caller.clone_from(&self.node_id);
            if ctx.call_timeout_ms == 0 {
                ctx.call_timeout_ms = self.config.call_timeout_ms;
            }
        }
        let timeout = Duration::from_millis(op.ctx().call_timeout_ms);
        let (invocation, future) = Invocation::new(call_id, op, mode, timeout, Instant::now());

        if let Err(err) = self.registry.register(Arc::clone(&invocation)) {
            warn!(call_id, error = %err, "invocation registration failed");
            invocation.complete(Err(InvocationError::Internal(err.to_string())));
            return future;
        }
        self.record_pending();

        self.send_attempt(&invocation).await;
        future
    }

    /// Sends a fire-and-forget operation (`call_id == 0`) to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation cannot be encoded or the target is
    /// unreachable. Delivery is not confirmed.
    pub async fn send_oneway(&self, target: &str, mut op: Operation) -> anyhow::Result<()> {
        {
            let ctx = op.ctx_mut();
            ctx.call_id = 0;
            ctx.caller.clone_from(&self.node_id);
        }
        let operation = self.codec.encode(&op)?;
        self.transport
            .send(
                target,
                Packet::Request {
                    call_id: 0,
                    attempt: 0,
                    caller: self.node_id.clone(),
                    operation,
                },
            )
            .await?;
        Ok(())
    }

    /// Acknowledges a synchronous backup to the member awaiting attempt
    /// `attempt` of `call_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is unreachable.
    pub async fn send_backup_ack(&self, target: &str, call_id: u64, attempt: u32) -> anyhow::Result<()> {
        self.transport
            .send(target, Packet::BackupAck { call_id, attempt })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attempts and retries
    // -----------------------------------------------------------------------

    fn resolve_target(&self, invocation: &Invocation) -> Option<String> {
        match invocation.target_mode() {
            InvocationTarget::PartitionOwner => self.partitions.owner(invocation.partition_id()),
            InvocationTarget::Member(node_id) => Some(node_id.clone()),
        }
    }

    async fn send_attempt(self: &Arc<Self>, invocation: &Arc<Invocation>) {
        let call_id = invocation.call_id();
        let attempt = invocation.attempts();

        let Some(target) = self.resolve_target(invocation) else {
            self.retry_or_fail(
                invocation,
                attempt,
                AttemptFailure::NoOwner {
                    partition_id: invocation.partition_id(),
                },
            );
            return;
        };

        let operation = match self.codec.encode(invocation.operation()) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.fail(call_id, InvocationError::Codec(err.to_string()));
                return;
            }
        };

        let attempt_deadline = Instant::now() + self.config.try_timeout();
        if !invocation.begin_attempt(target.clone(), attempt, attempt_deadline) {
            return;
        }
        trace!(
            call_id,
            attempt,
            target = %target,
            kind = invocation.kind().name(),
            "sending invocation"
        );

        let packet = Packet::Request {
            call_id,
            attempt,
            caller: self.node_id.clone(),
            operation,
        };
        if let Err(err) = self.transport.send(&target, packet).await {
            debug!(call_id, target = %target, error = %err, "send failed");
            self.retry_or_fail(invocation, attempt, AttemptFailure::Unreachable { target });
        }
    }

    /// Schedules the retry following attempt `observed`, or fails the
    /// invocation once its deadline or retry budget is spent.
    ///
    /// Returns `true` if this call scheduled a retry.
    fn retry_or_fail(
        self: &Arc<Self>,
        invocation: &Arc<Invocation>,
        observed: u32,
        cause: AttemptFailure,
    ) -> bool {
        let call_id = invocation.call_id();
        if invocation.state().is_terminal() {
            return false;
        }
        if invocation.is_expired(Instant::now()) {
            self.fail(call_id, timeout_error(invocation));
            return false;
        }
        let Some(attempts) = invocation.claim_retry(observed) else {
            return false;
        };
        if attempts > self.config.max_retries {
            self.fail(
                call_id,
                InvocationError::RetriesExhausted {
                    call_id,
                    attempts,
                    cause,
                },
            );
            return false;
        }

        metrics::counter!("relaygrid_invocation_retries_total", "kind" => invocation.kind().name())
            .increment(1);
        let pause = self.retry_pause();
        debug!(call_id, attempts, cause = %cause, pause = ?pause, "retrying invocation");

        let this = Arc::clone(self);
        let invocation = Arc::clone(invocation);
        tokio::spawn(async move {
            tokio::time::sleep(pause).await;
            if this.registry.contains(invocation.call_id()) {
                this.send_attempt(&invocation).await;
            }
        });
        true
    }

    fn retry_pause(&self) -> Duration {
        let base = self.config.retry_pause_ms;
        let jitter = if base == 0 {
            0
        } else {
            rand::rng().random_range(0..=base)
        };
        Duration::from_millis(base + jitter)
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_pending(&self) {
        metrics::gauge!("relaygrid_invocations_pending").set(self.registry.len() as f64);
    }

    fn fail(&self, call_id: u64, error: InvocationError) {
        if self.registry.complete(call_id, Err(error)).is_ok() {
            metrics::counter!("relaygrid_invocations_failed_total").increment(1);
        }
    }

    // -----------------------------------------------------------------------
    // Completion paths
    // -----------------------------------------------------------------------

    /// Handles the response envelope of attempt `attempt` of `call_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for late or unknown responses.
    pub fn notify_response(
        self: &Arc<Self>,
        call_id: u64,
        attempt: u32,
        envelope: ResponseEnvelope,
    ) -> Result<(), RegistryError> {
        let Some(invocation) = self.registry.get(call_id) else {
            debug!(call_id, "response for unknown invocation dropped");
            return Err(RegistryError::NotFound(call_id));
        };

        let current = invocation.current_attempt();
        match envelope.outcome {
            Ok(response) if envelope.backup_acks == 0 => self.registry.complete(call_id, Ok(response)),
            Ok(response) => {
                if invocation.park_for_backups(attempt, response, envelope.backup_acks) {
                    self.release_parked(call_id);
                }
                Ok(())
            }
            Err(failure) if attempt != current => {
                trace!(call_id, attempt, current, error = %failure, "failure from superseded attempt ignored");
                Ok(())
            }
            Err(RemoteFailure::WrongTarget { partition_id }) => {
                let target = current_target(&invocation);
                self.retry_or_fail(
                    &invocation,
                    attempt,
                    AttemptFailure::WrongTarget {
                        target,
                        partition_id,
                    },
                );
                Ok(())
            }
            Err(RemoteFailure::Overloaded { partition_id }) => {
                let target = current_target(&invocation);
                self.retry_or_fail(
                    &invocation,
                    attempt,
                    AttemptFailure::Overloaded {
                        target,
                        partition_id,
                    },
                );
                Ok(())
            }
            Err(failure) => self.registry.complete(call_id, Err(failure.into())),
        }
    }

    /// Counts a backup ack for attempt `attempt` of `call_id`, completing it
    /// once all expected acks and the response are in.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the invocation already finished.
    pub fn notify_backup_ack(&self, call_id: u64, attempt: u32) -> Result<(), RegistryError> {
        let invocation = self
            .registry
            .get(call_id)
            .ok_or(RegistryError::NotFound(call_id))?;
        if invocation.record_backup_ack(attempt) {
            self.release_parked(call_id);
        }
        Ok(())
    }

    fn release_parked(&self, call_id: u64) {
        if let Some(invocation) = self.registry.deregister(call_id) {
            let result = invocation.take_parked_response().ok_or_else(|| {
                InvocationError::Internal(format!("invocation {call_id} lost its parked response"))
            });
            invocation.complete(result);
        }
    }

    /// Completes `call_id` with a response delivered out of band by the
    /// partition owner.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the regular response won.
    pub fn complete_from_caller_update(
        &self,
        call_id: u64,
        response: OperationResponse,
    ) -> Result<(), RegistryError> {
        self.registry.complete(call_id, Ok(response))
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Fails expired invocations and retries attempts that went silent.
    pub fn sweep(self: &Arc<Self>, now: Instant) -> SweepOutcome {
        let mut expired = Vec::new();
        let mut silent = Vec::new();
        for invocation in self.registry.iter() {
            if invocation.is_expired(now) {
                expired.push(invocation);
            } else if let Some(attempt) = invocation.silent_attempt(now) {
                silent.push((invocation, attempt));
            }
        }

        let mut outcome = SweepOutcome::default();
        for invocation in expired {
            let error = timeout_error(&invocation);
            if self.registry.complete(invocation.call_id(), Err(error)).is_ok() {
                metrics::counter!("relaygrid_invocation_timeouts_total", "kind" => invocation.kind().name())
                    .increment(1);
                warn!(
                    call_id = invocation.call_id(),
                    kind = invocation.kind().name(),
                    attempts = invocation.attempts(),
                    "invocation timed out"
                );
                outcome.timed_out += 1;
            }
        }
        for (invocation, attempt) in silent {
            if invocation.state() != InvocationState::AwaitingResponse {
                continue;
            }
            let cause = AttemptFailure::Silent {
                target: current_target(&invocation),
                timeout_ms: self.config.try_timeout_ms,
            };
            if self.retry_or_fail(&invocation, attempt, cause) {
                outcome.retried += 1;
            }
        }
        self.record_pending();
        outcome
    }

    /// Fails every outstanding invocation with [`InvocationError::Abandoned`].
    pub fn abandon_all(&self) -> usize {
        let mut abandoned = 0;
        for call_id in self.registry.call_ids() {
            if self
                .registry
                .complete(call_id, Err(InvocationError::Abandoned { call_id }))
                .is_ok()
            {
                abandoned += 1;
            }
        }
        abandoned
    }
}

fn current_target(invocation: &Invocation) -> String {
    invocation
        .target()
        .map(|t| t.as_ref().clone())
        .unwrap_or_default()
}

fn timeout_error(invocation: &Invocation) -> InvocationError {
    InvocationError::Timeout {
        call_id: invocation.call_id(),
        timeout_ms: u64::try_from(invocation.timeout().as_millis()).unwrap_or(u64::MAX),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relaygrid_core::Value;

    use super::*;
    use crate::cluster::ClusterPartitionTable;
    use crate::network::TransportError;
    use crate::service::operation::{KeyPayload, OperationContext};

    /// Records every packet; optionally fails sends to listed targets.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, Packet)>>,
        unreachable: Mutex<Vec<String>>,
    }

    impl RecordingTransport {
        fn requests(&self) -> Vec<(String, u64)> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(target, p)| match p {
                    Packet::Request { call_id, .. } => Some((target.clone(), *call_id)),
                    _ => None,
                })
                .collect()
        }

        fn request_attempts(&self) -> Vec<u32> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(_, p)| match p {
                    Packet::Request { attempt, .. } => Some(*attempt),
                    _ => None,
                })
                .collect()
        }

        async fn wait_for_requests(&self, count: usize) {
            for _ in 0..50 {
                if self.requests().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn local_node_id(&self) -> &str {
            "a"
        }

        async fn send(&self, target: &str, packet: Packet) -> Result<(), TransportError> {
            if self.unreachable.lock().iter().any(|t| t == target) {
                return Err(TransportError::Unreachable {
                    node_id: target.to_string(),
                });
            }
            self.sent.lock().push((target.to_string(), packet));
            Ok(())
        }
    }

    struct Fixture {
        service: Arc<OperationService>,
        transport: Arc<RecordingTransport>,
        table: Arc<ClusterPartitionTable>,
    }

    fn fixture(config: ServerConfig) -> Fixture {
        let table = Arc::new(ClusterPartitionTable::new(4));
        for pid in 0..4 {
            table.set_owner(pid, "b".to_string(), vec!["c".to_string()]);
        }
        let transport = Arc::new(RecordingTransport::default());
        let service = Arc::new(OperationService::new(
            Arc::new(config),
            table.clone(),
            transport.clone(),
            Arc::new(OperationCodec::new()),
        ));
        Fixture {
            service,
            transport,
            table,
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            partition_count: 4,
            call_timeout_ms: 1_000,
            try_timeout_ms: 100,
            retry_pause_ms: 0,
            max_retries: 3,
            ..ServerConfig::for_node("a")
        }
    }

    fn get_op(partition_id: u32) -> Operation {
        Operation::Get {
            ctx: OperationContext::new(partition_id, 0),
            target: KeyPayload {
                name: "m".to_string(),
                key: "k".to_string(),
            },
        }
    }

    fn ok_envelope(value: i64) -> ResponseEnvelope {
        ResponseEnvelope {
            backup_acks: 0,
            outcome: Ok(OperationResponse::Value(Some(Value::Int(value)))),
        }
    }

    #[tokio::test]
    async fn call_ids_are_unique_and_start_at_one() {
        let fx = fixture(config());
        let f1 = fx.service.dispatch(get_op(0)).await;
        let f2 = fx.service.dispatch(get_op(1)).await;
        assert_eq!(f1.call_id(), 1);
        assert_eq!(f2.call_id(), 2);
        assert_eq!(fx.transport.requests(), vec![("b".to_string(), 1), ("b".to_string(), 2)]);
        assert_eq!(fx.service.registry().len(), 2);
    }

    #[tokio::test]
    async fn response_completes_and_deregisters() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(0)).await;
        let call_id = fut.call_id();

        fx.service.notify_response(call_id, 0, ok_envelope(5)).unwrap();
        assert_eq!(fut.await, Ok(OperationResponse::Value(Some(Value::Int(5)))));
        assert!(!fx.service.registry().contains(call_id));
    }

    #[tokio::test]
    async fn late_response_is_ignored() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(0)).await;
        let call_id = fut.call_id();

        let outcome = fx.service.sweep(Instant::now() + Duration::from_secs(2));
        assert_eq!(outcome.timed_out, 1);
        assert!(matches!(fut.await, Err(InvocationError::Timeout { .. })));

        assert_eq!(
            fx.service.notify_response(call_id, 0, ok_envelope(1)),
            Err(RegistryError::NotFound(call_id))
        );
    }

    #[tokio::test]
    async fn application_failure_is_not_retried() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(0)).await;
        fx.service
            .notify_response(
                fut.call_id(),
                0,
                ResponseEnvelope::failure(RemoteFailure::Application {
                    message: "bad value".to_string(),
                }),
            )
            .unwrap();
        assert_eq!(fut.await, Err(InvocationError::Application("bad value".to_string())));
        assert_eq!(fx.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn wrong_target_retries_against_new_owner() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(2)).await;
        let call_id = fut.call_id();

        fx.table.transfer_ownership(2, "c");
        fx.service
            .notify_response(
                call_id,
                0,
                ResponseEnvelope::failure(RemoteFailure::WrongTarget { partition_id: 2 }),
            )
            .unwrap();

        fx.transport.wait_for_requests(2).await;
        assert_eq!(
            fx.transport.requests(),
            vec![("b".to_string(), call_id), ("c".to_string(), call_id)]
        );

        fx.service.notify_response(call_id, 1, ok_envelope(9)).unwrap();
        assert!(fut.await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_target_exhausts_retries() {
        let fx = fixture(config());
        fx.transport.unreachable.lock().push("b".to_string());

        let result = fx.service.invoke(get_op(1)).await;
        match result {
            Err(InvocationError::RetriesExhausted {
                attempts, cause, ..
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(
                    cause,
                    AttemptFailure::Unreachable {
                        target: "b".to_string()
                    }
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(fx.service.registry().is_empty());
    }

    #[tokio::test]
    async fn missing_owner_is_retried_until_exhausted() {
        let fx = fixture(ServerConfig {
            max_retries: 1,
            ..config()
        });
        let result = fx.service.invoke(get_op(9)).await;
        assert!(matches!(
            result,
            Err(InvocationError::RetriesExhausted {
                cause: AttemptFailure::NoOwner { partition_id: 9 },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn sweep_retries_silent_attempt() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(0)).await;

        let outcome = fx.service.sweep(Instant::now() + Duration::from_millis(200));
        assert_eq!(outcome.retried, 1);
        fx.transport.wait_for_requests(2).await;
        assert_eq!(fx.transport.requests().len(), 2);
        assert!(fx.service.registry().contains(fut.call_id()));
    }

    #[tokio::test]
    async fn backup_acks_gate_completion() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(0)).await;
        let call_id = fut.call_id();

        fx.service.notify_backup_ack(call_id, 0).unwrap();
        fx.service
            .notify_response(
                call_id,
                0,
                ResponseEnvelope {
                    backup_acks: 2,
                    outcome: Ok(OperationResponse::Value(None)),
                },
            )
            .unwrap();
        assert!(fx.service.registry().contains(call_id));

        fx.service.notify_backup_ack(call_id, 0).unwrap();
        assert_eq!(fut.await, Ok(OperationResponse::Value(None)));
        assert_eq!(
            fx.service.notify_backup_ack(call_id, 0),
            Err(RegistryError::NotFound(call_id))
        );
    }

    #[tokio::test]
    async fn caller_update_and_response_race_has_one_winner() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(0)).await;
        let call_id = fut.call_id();

        let update = OperationResponse::Versioned {
            old_value: None,
            version: 1,
        };
        fx.service
            .complete_from_caller_update(call_id, update.clone())
            .unwrap();
        assert!(fx.service.notify_response(call_id, 0, ok_envelope(1)).is_err());
        assert_eq!(fut.await, Ok(update));
    }

    #[tokio::test]
    async fn oneway_uses_call_id_zero() {
        let fx = fixture(config());
        fx.service.send_oneway("c", get_op(0)).await.unwrap();
        assert_eq!(fx.transport.requests(), vec![("c".to_string(), 0)]);
        assert!(fx.service.registry().is_empty());
    }

    #[tokio::test]
    async fn abandon_all_fails_pending() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(0)).await;
        assert_eq!(fx.service.abandon_all(), 1);
        assert!(matches!(fut.await, Err(InvocationError::Abandoned { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_does_not_reclaim_retry_during_pause() {
        let fx = fixture(ServerConfig {
            call_timeout_ms: 10_000,
            retry_pause_ms: 500,
            ..config()
        });
        let start = Instant::now();
        let fut = fx.service.dispatch(get_op(0)).await;
        let call_id = fut.call_id();

        let first = fx.service.sweep(start + Duration::from_millis(200));
        assert_eq!(first.retried, 1);
        let second = fx.service.sweep(start + Duration::from_millis(250));
        assert_eq!(second.retried, 0);
        let invocation = fx.service.registry().get(call_id).unwrap();
        assert_eq!(invocation.attempts(), 1);
        assert_eq!(invocation.state(), InvocationState::Pending);

        // Jitter keeps the pause within twice the base.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(fx.transport.request_attempts(), vec![0, 1]);
        assert_eq!(invocation.state(), InvocationState::AwaitingResponse);
    }

    #[tokio::test]
    async fn failure_from_superseded_attempt_is_ignored() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(2)).await;
        let call_id = fut.call_id();

        fx.service.sweep(Instant::now() + Duration::from_millis(200));
        fx.transport.wait_for_requests(2).await;
        assert_eq!(fx.transport.request_attempts(), vec![0, 1]);

        fx.service
            .notify_response(
                call_id,
                0,
                ResponseEnvelope::failure(RemoteFailure::WrongTarget { partition_id: 2 }),
            )
            .unwrap();
        fx.service
            .notify_response(
                call_id,
                0,
                ResponseEnvelope::failure(RemoteFailure::Internal {
                    message: "gone".to_string(),
                }),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.transport.requests().len(), 2);
        let invocation = fx.service.registry().get(call_id).unwrap();
        assert_eq!(invocation.attempts(), 1);

        fx.service.notify_response(call_id, 1, ok_envelope(3)).unwrap();
        assert_eq!(fut.await, Ok(OperationResponse::Value(Some(Value::Int(3)))));
    }

    #[tokio::test]
    async fn backup_acks_of_superseded_attempt_do_not_count() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(0)).await;
        let call_id = fut.call_id();

        fx.service.notify_backup_ack(call_id, 0).unwrap();
        fx.service.sweep(Instant::now() + Duration::from_millis(200));
        fx.transport.wait_for_requests(2).await;

        fx.service.notify_backup_ack(call_id, 0).unwrap();
        fx.service
            .notify_response(
                call_id,
                1,
                ResponseEnvelope {
                    backup_acks: 1,
                    outcome: Ok(OperationResponse::Value(None)),
                },
            )
            .unwrap();
        assert!(fx.service.registry().contains(call_id));

        fx.service.notify_backup_ack(call_id, 1).unwrap();
        assert_eq!(fut.await, Ok(OperationResponse::Value(None)));
    }

    #[tokio::test]
    async fn overloaded_target_is_retried() {
        let fx = fixture(config());
        let fut = fx.service.dispatch(get_op(1)).await;
        let call_id = fut.call_id();

        fx.service
            .notify_response(
                call_id,
                0,
                ResponseEnvelope::failure(RemoteFailure::Overloaded { partition_id: 1 }),
            )
            .unwrap();
        fx.transport.wait_for_requests(2).await;
        assert_eq!(
            fx.transport.requests(),
            vec![("b".to_string(), call_id), ("b".to_string(), call_id)]
        );
        assert!(fx.service.registry().contains(call_id));
    }
}
