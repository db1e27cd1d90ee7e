//! Tower middleware for the lane pipeline.
//!
//! - [`metrics`]: operation timing, outcome counters and tracing spans
//! - [`pipeline`]: composes the layers around the router

pub mod metrics;
pub mod pipeline;

pub use metrics::MetricsLayer;
pub use pipeline::build_lane_pipeline;
