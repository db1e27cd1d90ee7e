//! Background worker driving a [`BackgroundRunnable`] from a task queue and an
//! optional periodic tick.
//!
//! Partition lanes, the invocation sweeper and the diagnostics monitor all run
//! on this worker.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Capacity of every worker's task queue.
pub const TASK_QUEUE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by a [`BackgroundWorker`].
///
/// Tasks and ticks are handled one at a time, in arrival order.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on every tick when the worker was started with an interval.
    async fn on_tick(&mut self) {}

    /// Called once after the worker loop exits.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned worker loop.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop. With `tick_interval == None` the runnable only
    /// sees submitted tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(mut runnable: R, tick_interval: Option<Duration>) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_QUEUE_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tick_interval.map(|period| {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });
            // The first tick completes immediately; skip it.
            if let Some(ticker) = ticker.as_mut() {
                ticker.tick().await;
            }

            loop {
                // Queued tasks drain before shutdown is observed.
                tokio::select! {
                    biased;
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    () = next_tick(ticker.as_mut()) => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task if the queue has room, handing it back otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`TrySendError::Full`] when the queue is at capacity and
    /// [`TrySendError::Closed`] once the worker has been stopped.
    pub fn try_submit(&self, task: R::Task) -> Result<(), TrySendError<R::Task>> {
        match &self.tx {
            Some(tx) => tx.try_send(task),
            None => Err(TrySendError::Closed(task)),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals shutdown and waits for the loop to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn next_tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
