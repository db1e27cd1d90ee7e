//! Partition execution lanes.
//!
//! Each lane is a [`BackgroundWorker`] running its own copy of the operation
//! pipeline. A partition always maps to the same lane, so operations on one
//! partition execute one at a time in arrival order while different lanes
//! run in parallel.

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tower::util::BoxService;
use tower::{Service, ServiceExt};

use super::operation::{Operation, OperationError, OperationResponse};
use super::worker::{BackgroundRunnable, BackgroundWorker};

pub type LaneService = BoxService<Operation, OperationResponse, OperationError>;

pub type LaneResult = Result<OperationResponse, OperationError>;

/// An operation queued on a lane with the channel its result goes to.
pub struct LaneTask {
    pub operation: Operation,
    pub reply: oneshot::Sender<LaneResult>,
}

/// Runs queued operations through one lane's pipeline.
pub struct LaneRunnable {
    lane: usize,
    service: LaneService,
}

#[async_trait]
impl BackgroundRunnable for LaneRunnable {
    type Task = LaneTask;

    async fn run(&mut self, task: LaneTask) {
        let LaneTask { operation, reply } = task;
        let result = match self.service.ready().await {
            Ok(svc) => svc.call(operation).await,
            Err(err) => Err(err),
        };
        if reply.send(result).is_err() {
            tracing::trace!(lane = self.lane, "lane result receiver dropped");
        }
    }
}

/// Fixed set of lanes indexed by `partition_id % lane_count`.
pub struct PartitionLanes {
    lanes: Vec<BackgroundWorker<LaneRunnable>>,
}

impl PartitionLanes {
    /// Starts `lane_count` lanes (at least one), building each lane's pipeline
    /// with `make_service(lane_index)`.
    pub fn start<F>(lane_count: usize, mut make_service: F) -> Self
    where
        F: FnMut(usize) -> LaneService,
    {
        let lanes = (0..lane_count.max(1))
            .map(|lane| {
                BackgroundWorker::start(
                    LaneRunnable {
                        lane,
                        service: make_service(lane),
                    },
                    None,
                )
            })
            .collect();
        Self { lanes }
    }

    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    #[must_use]
    pub fn lane_for(&self, partition_id: u32) -> usize {
        partition_id as usize % self.lanes.len()
    }

    /// Queues `operation` on its partition's lane without waiting for
    /// capacity.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Overloaded`] if the lane queue is full and
    /// [`OperationError::Internal`] if the lane has stopped.
    pub fn try_submit(
        &self,
        operation: Operation,
    ) -> Result<oneshot::Receiver<LaneResult>, OperationError> {
        let partition_id = operation.partition_id();
        let lane = self.lane_for(partition_id);
        let (reply, rx) = oneshot::channel();
        match self.lanes[lane].try_submit(LaneTask { operation, reply }) {
            Ok(()) => Ok(rx),
            Err(TrySendError::Full(_)) => Err(OperationError::Overloaded { partition_id }),
            Err(TrySendError::Closed(_)) => Err(OperationError::Internal(anyhow::anyhow!(
                "lane {lane} is not running"
            ))),
        }
    }

    /// Stops all lanes after they drain their queues.
    pub async fn stop(&mut self) {
        for lane in &mut self.lanes {
            lane.stop().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
