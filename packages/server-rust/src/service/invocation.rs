//! One outstanding remote call and its completion future.
//!
//! An [`Invocation`] moves through
//! `Pending -> AwaitingResponse -> (AwaitingBackups) -> Completed | Failed`.
//! The terminal transition is a compare-and-swap: whichever path reaches it
//! first (response, caller update, backup ack, timeout) delivers the result,
//! and every later attempt is a no-op.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::operation::{Operation, OperationKind, OperationResponse, RemoteFailure};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a single attempt did not produce a usable response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptFailure {
    #[error("partition {partition_id} has no owner")]
    NoOwner { partition_id: u32 },
    #[error("{target} does not own partition {partition_id}")]
    WrongTarget { target: String, partition_id: u32 },
    #[error("{target} is unreachable")]
    Unreachable { target: String },
    #[error("no response from {target} within {timeout_ms}ms")]
    Silent { target: String, timeout_ms: u64 },
    #[error("{target} is overloaded on partition {partition_id}")]
    Overloaded { target: String, partition_id: u32 },
}

/// Terminal failure delivered to the caller of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("invocation {call_id} timed out after {timeout_ms}ms")]
    Timeout { call_id: u64, timeout_ms: u64 },
    #[error("invocation {call_id} gave up after {attempts} attempts: {cause}")]
    RetriesExhausted {
        call_id: u64,
        attempts: u32,
        cause: AttemptFailure,
    },
    #[error("{0}")]
    Application(String),
    #[error("codec failure: {0}")]
    Codec(String),
    #[error("invocation {call_id} abandoned")]
    Abandoned { call_id: u64 },
    #[error("internal failure: {0}")]
    Internal(String),
}

impl From<RemoteFailure> for InvocationError {
    fn from(failure: RemoteFailure) -> Self {
        match failure {
            RemoteFailure::Application { message } => InvocationError::Application(message),
            RemoteFailure::Codec { message } => InvocationError::Codec(message),
            RemoteFailure::WrongTarget { partition_id } => InvocationError::Internal(format!(
                "unretried wrong-target failure for partition {partition_id}"
            )),
            RemoteFailure::Overloaded { partition_id } => InvocationError::Internal(format!(
                "unretried overload failure for partition {partition_id}"
            )),
            RemoteFailure::Internal { message } => InvocationError::Internal(message),
        }
    }
}

pub type InvocationResult = Result<OperationResponse, InvocationError>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InvocationState {
    Pending = 0,
    AwaitingResponse = 1,
    AwaitingBackups = 2,
    Completed = 3,
    Failed = 4,
}

impl InvocationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => InvocationState::Pending,
            1 => InvocationState::AwaitingResponse,
            2 => InvocationState::AwaitingBackups,
            3 => InvocationState::Completed,
            _ => InvocationState::Failed,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationState::Completed | InvocationState::Failed)
    }
}

/// How the target member of each attempt is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationTarget {
    /// Re-resolve the partition owner on every attempt.
    PartitionOwner,
    /// Always send to this member.
    Member(String),
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Number and try deadline of the attempt in flight.
#[derive(Debug, Clone, Copy)]
struct AttemptSlot {
    number: u32,
    deadline: Instant,
}

/// Registry entry for an outstanding call.
pub struct Invocation {
    call_id: u64,
    operation: Operation,
    kind: OperationKind,
    target_mode: InvocationTarget,
    target: ArcSwapOption<String>,
    state: AtomicU8,
    attempts: AtomicU32,
    timeout: Duration,
    deadline: Instant,
    attempt: Mutex<AttemptSlot>,
    backups_expected: AtomicU32,
    backups_acked: AtomicU32,
    parked: Mutex<Option<OperationResponse>>,
    completion: Mutex<Option<oneshot::Sender<InvocationResult>>>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("call_id", &self.call_id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

impl Invocation {
    /// Creates an invocation and the future its caller awaits.
    #[must_use]
    pub fn new(
        call_id: u64,
        operation: Operation,
        target_mode: InvocationTarget,
        timeout: Duration,
        now: Instant,
    ) -> (Arc<Self>, InvocationFuture) {
        let (tx, rx) = oneshot::channel();
        let kind = operation.kind();
        let deadline = now + timeout;
        let invocation = Arc::new(Self {
            call_id,
            operation,
            kind,
            target_mode,
            target: ArcSwapOption::empty(),
            state: AtomicU8::new(InvocationState::Pending as u8),
            attempts: AtomicU32::new(0),
            timeout,
            deadline,
            attempt: Mutex::new(AttemptSlot {
                number: 0,
                deadline,
            }),
            backups_expected: AtomicU32::new(0),
            backups_acked: AtomicU32::new(0),
            parked: Mutex::new(None),
            completion: Mutex::new(Some(tx)),
        });
        (invocation, InvocationFuture { call_id, rx })
    }

    #[must_use]
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    #[must_use]
    pub fn partition_id(&self) -> u32 {
        self.operation.partition_id()
    }

    #[must_use]
    pub fn target_mode(&self) -> &InvocationTarget {
        &self.target_mode
    }

    /// Member the current attempt was sent to.
    #[must_use]
    pub fn target(&self) -> Option<Arc<String>> {
        self.target.load_full()
    }

    #[must_use]
    pub fn state(&self) -> InvocationState {
        InvocationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Number of retries scheduled so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Number of the attempt most recently sent.
    #[must_use]
    pub fn current_attempt(&self) -> u32 {
        self.attempt.lock().number
    }

    /// Number of the in-flight attempt if it has been silent past its try
    /// deadline. An invocation waiting out a retry pause has no attempt in
    /// flight and yields `None`.
    #[must_use]
    pub fn silent_attempt(&self, now: Instant) -> Option<u32> {
        let slot = *self.attempt.lock();
        (self.state() == InvocationState::AwaitingResponse && now >= slot.deadline)
            .then_some(slot.number)
    }

    /// Records that attempt `number` is about to be sent to `target`. Backup
    /// acks counted for earlier attempts are discarded.
    ///
    /// Returns `false` if the invocation already finished.
    pub fn begin_attempt(&self, target: String, number: u32, attempt_deadline: Instant) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.target.store(Some(Arc::new(target)));
        {
            let mut slot = self.attempt.lock();
            *slot = AttemptSlot {
                number,
                deadline: attempt_deadline.min(self.deadline),
            };
            self.backups_expected.store(0, Ordering::SeqCst);
            self.backups_acked.store(0, Ordering::SeqCst);
        }
        let _ = self.state.compare_exchange(
            InvocationState::Pending as u8,
            InvocationState::AwaitingResponse as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        !self.state().is_terminal()
    }

    /// Claims the retry that follows attempt number `observed`.
    ///
    /// Two failure signals for the same attempt (a transport error and a
    /// sweeper timeout, say) race here; only one gets `Some(attempts)`. The
    /// winner moves the invocation back to `Pending`, where it stays until
    /// the next [`begin_attempt`](Self::begin_attempt).
    pub fn claim_retry(&self, observed: u32) -> Option<u32> {
        let attempts = self
            .attempts
            .compare_exchange(observed, observed + 1, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|prev| prev + 1)?;
        let _ = self.state.compare_exchange(
            InvocationState::AwaitingResponse as u8,
            InvocationState::Pending as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Some(attempts)
    }

    /// Parks the successful response of attempt `attempt` until `expected`
    /// backup acks for that attempt arrive.
    ///
    /// Returns `true` if enough acks were already counted and the invocation
    /// can complete immediately. A response from a superseded attempt is not
    /// parked and returns `false`.
    pub fn park_for_backups(&self, attempt: u32, response: OperationResponse, expected: u32) -> bool {
        let slot = self.attempt.lock();
        if slot.number != attempt {
            return false;
        }
        *self.parked.lock() = Some(response);
        self.backups_expected.store(expected, Ordering::SeqCst);
        let moved = self
            .state
            .compare_exchange(
                InvocationState::AwaitingResponse as u8,
                InvocationState::AwaitingBackups as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        moved && self.backups_acked.load(Ordering::SeqCst) >= expected
    }

    /// Counts one backup ack for attempt `attempt`. Returns `true` once the
    /// parked response may be delivered. Acks for other attempts are dropped.
    pub fn record_backup_ack(&self, attempt: u32) -> bool {
        let slot = self.attempt.lock();
        if slot.number != attempt {
            return false;
        }
        let acked = self.backups_acked.fetch_add(1, Ordering::SeqCst) + 1;
        self.state() == InvocationState::AwaitingBackups
            && acked >= self.backups_expected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn backups_acked(&self) -> u32 {
        self.backups_acked.load(Ordering::SeqCst)
    }

    pub fn take_parked_response(&self) -> Option<OperationResponse> {
        self.parked.lock().take()
    }

    /// Performs the terminal transition and delivers `result`.
    ///
    /// Returns `false` if another path already completed the invocation.
    pub fn complete(&self, result: InvocationResult) -> bool {
        let terminal = if result.is_ok() {
            InvocationState::Completed
        } else {
            InvocationState::Failed
        };
        loop {
            let current = self.state.load(Ordering::SeqCst);
            if InvocationState::from_u8(current).is_terminal() {
                return false;
            }
            if self
                .state
                .compare_exchange(current, terminal as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if let Some(tx) = self.completion.lock().take() {
                    // Caller may have dropped its future.
                    let _ = tx.send(result);
                }
                return true;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InvocationFuture
// ---------------------------------------------------------------------------

/// Resolves once the invocation reaches a terminal state.
#[derive(Debug)]
pub struct InvocationFuture {
    call_id: u64,
    rx: oneshot::Receiver<InvocationResult>,
}

impl InvocationFuture {
    #[must_use]
    pub fn call_id(&self) -> u64 {
        self.call_id
    }
}

impl Future for InvocationFuture {
    type Output = InvocationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let call_id = self.call_id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(InvocationError::Abandoned { call_id })))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
