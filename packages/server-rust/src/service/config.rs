use std::time::Duration;

use relaygrid_core::PARTITION_COUNT;
use serde::{Deserialize, Serialize};

/// Member-level configuration for the invocation framework.
///
/// Every field has a default, so partial documents deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unique identifier of this member.
    pub node_id: String,
    /// Number of partitions. Must match across the cluster.
    pub partition_count: u32,
    /// Replicas written after the owner for replicated and partitioned maps.
    pub backup_count: u32,
    /// Partition execution lanes. A partition always maps to the same lane.
    pub lane_count: usize,
    /// Retries allowed per invocation after the first attempt.
    pub max_retries: u32,
    /// Overall deadline for an invocation in milliseconds.
    pub call_timeout_ms: u64,
    /// Silence after which an attempt is retried, in milliseconds.
    pub try_timeout_ms: u64,
    /// Base pause before a retry, in milliseconds. Jitter of up to the same
    /// amount is added.
    pub retry_pause_ms: u64,
    /// Interval of the invocation sweeper in milliseconds.
    pub sweep_interval_ms: u64,
    /// Period of the pending-invocations monitor in seconds. 0 disables it.
    pub monitor_period_secs: u64,
    /// Minimum pending count for a kind to be listed by the monitor.
    pub monitor_threshold: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            partition_count: PARTITION_COUNT,
            backup_count: 1,
            lane_count: 8,
            max_retries: 5,
            call_timeout_ms: 30_000,
            try_timeout_ms: 5_000,
            retry_pause_ms: 100,
            sweep_interval_ms: 1_000,
            monitor_period_secs: 0,
            monitor_threshold: 1,
        }
    }
}

impl ServerConfig {
    /// Default config for `node_id`.
    #[must_use]
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    #[must_use]
    pub fn try_timeout(&self) -> Duration {
        Duration::from_millis(self.try_timeout_ms)
    }

    #[must_use]
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// `None` when the monitor is disabled.
    #[must_use]
    pub fn monitor_period(&self) -> Option<Duration> {
        (self.monitor_period_secs > 0).then(|| Duration::from_secs(self.monitor_period_secs))
    }
}
