//! Diagnostics: the pending invocations monitor and its writers.

pub mod pending_invocations;
pub mod writer;

pub use pending_invocations::{MonitorTask, PendingInvocationsMonitor};
pub use writer::{DiagnosticsReport, DiagnosticsWriter, LogDiagnosticsWriter};
