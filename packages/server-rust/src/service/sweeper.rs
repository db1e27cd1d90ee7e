//! Periodic invocation sweep: times out expired calls and retries silent
//! attempts.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

use super::dispatch::{OperationService, SweepOutcome};
use super::worker::BackgroundRunnable;

/// On-demand requests accepted by the sweeper worker.
#[derive(Debug)]
pub enum SweepTask {
    /// Sweep immediately, outside the tick schedule.
    Now,
}

pub struct InvocationSweeper {
    operations: Arc<OperationService>,
}

impl InvocationSweeper {
    #[must_use]
    pub fn new(operations: Arc<OperationService>) -> Self {
        Self { operations }
    }

    fn sweep(&self) {
        let outcome = self.operations.sweep(Instant::now());
        if outcome != SweepOutcome::default() {
            trace!(
                timed_out = outcome.timed_out,
                retried = outcome.retried,
                "invocation sweep"
            );
        }
    }
}

#[async_trait]
impl BackgroundRunnable for InvocationSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::Now => self.sweep(),
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}
