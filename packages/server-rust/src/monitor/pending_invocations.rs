//! Periodic report of outstanding invocations grouped by operation kind.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::writer::DiagnosticsWriter;
use crate::service::invocation_registry::InvocationRegistry;
use crate::service::worker::BackgroundRunnable;

pub const SECTION_NAME: &str = "PendingInvocations";
pub const INVOCATIONS_SECTION: &str = "invocations";

/// Aggregates the registry by kind and renders kinds seen at least
/// `threshold` times.
pub struct PendingInvocationsMonitor {
    registry: Arc<InvocationRegistry>,
    threshold: u64,
    occurrences: BTreeMap<&'static str, u64>,
}

impl PendingInvocationsMonitor {
    #[must_use]
    pub fn new(registry: Arc<InvocationRegistry>, threshold: u64) -> Self {
        Self {
            registry,
            threshold,
            occurrences: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Scans the registry and writes one report. Failures, including
    /// panics, are logged and reported as `false`; nothing carries over to
    /// the next run.
    pub fn run(&mut self, writer: &mut dyn DiagnosticsWriter) -> bool {
        self.occurrences.clear();
        match catch_unwind(AssertUnwindSafe(|| self.render(writer))) {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(error = %err, "pending invocations report failed");
                false
            }
            Err(_) => {
                warn!("pending invocations report panicked");
                false
            }
        }
    }

    fn render(&mut self, writer: &mut dyn DiagnosticsWriter) -> anyhow::Result<()> {
        for invocation in self.registry.iter() {
            *self.occurrences.entry(invocation.kind().name()).or_insert(0) += 1;
        }

        writer.start_section(SECTION_NAME)?;
        writer.write_entry("count", u64::try_from(self.registry.len()).unwrap_or(u64::MAX))?;
        writer.start_section(INVOCATIONS_SECTION)?;
        for (kind, count) in &self.occurrences {
            if *count >= self.threshold {
                writer.write_entry(kind, *count)?;
            }
        }
        writer.end_section()?;
        writer.end_section()
    }
}

/// Drives a monitor on a [`BackgroundWorker`](crate::service::worker::BackgroundWorker)
/// tick, writing every report to `writer`.
pub struct MonitorTask<W> {
    monitor: PendingInvocationsMonitor,
    writer: W,
}

impl<W: DiagnosticsWriter + 'static> MonitorTask<W> {
    #[must_use]
    pub fn new(monitor: PendingInvocationsMonitor, writer: W) -> Self {
        Self { monitor, writer }
    }
}

#[async_trait]
impl<W: DiagnosticsWriter + 'static> BackgroundRunnable for MonitorTask<W> {
    type Task = ();

    async fn run(&mut self, _task: ()) {
        self.monitor.run(&mut self.writer);
    }

    async fn on_tick(&mut self) {
        self.monitor.run(&mut self.writer);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relaygrid_core::Value;
    use tokio::time::Instant;

    use super::*;
    use crate::monitor::writer::DiagnosticsReport;
    use crate::service::invocation::{Invocation, InvocationTarget};
    use crate::service::operation::{
        EntryPayload, FlushPayload, KeyPayload, Operation, OperationContext,
    };

    fn put() -> Operation {
        Operation::Put {
            ctx: OperationContext::new(0, 0),
            entry: EntryPayload {
                name: "m".to_string(),
                key: "k".to_string(),
                value: Value::Int(1),
                ttl_millis: 0,
            },
        }
    }

    fn get() -> Operation {
        Operation::Get {
            ctx: OperationContext::new(0, 0),
            target: KeyPayload {
                name: "m".to_string(),
                key: "k".to_string(),
            },
        }
    }

    fn flush() -> Operation {
        Operation::Flush {
            ctx: OperationContext::new(0, 0),
            flush: FlushPayload {
                name: "m".to_string(),
                flush_all: false,
            },
        }
    }

    fn registry_with(ops: Vec<Operation>) -> Arc<InvocationRegistry> {
        let registry = Arc::new(InvocationRegistry::new());
        for (i, op) in ops.into_iter().enumerate() {
            let (invocation, _future) = Invocation::new(
                i as u64 + 1,
                op,
                InvocationTarget::PartitionOwner,
                Duration::from_secs(30),
                Instant::now(),
            );
            registry.register(invocation).unwrap();
        }
        registry
    }

    struct FailingWriter;

    impl DiagnosticsWriter for FailingWriter {
        fn start_section(&mut self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn write_entry(&mut self, _key: &str, _value: u64) -> anyhow::Result<()> {
            anyhow::bail!("sink closed")
        }

        fn end_section(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct PanickingWriter;

    impl DiagnosticsWriter for PanickingWriter {
        fn start_section(&mut self, _name: &str) -> anyhow::Result<()> {
            panic!("writer bug")
        }

        fn write_entry(&mut self, _key: &str, _value: u64) -> anyhow::Result<()> {
            Ok(())
        }

        fn end_section(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn report_groups_by_kind_above_threshold() {
        let registry = registry_with(vec![put(), put(), put(), get(), flush(), flush()]);
        let mut monitor = PendingInvocationsMonitor::new(registry, 2);
        let mut report = DiagnosticsReport::new();

        assert!(monitor.run(&mut report));
        let section = report.find(&[SECTION_NAME]).unwrap();
        assert_eq!(section.entry("count"), Some(6));

        let kinds = report.find(&[SECTION_NAME, INVOCATIONS_SECTION]).unwrap();
        assert_eq!(kinds.entry("replicatedmap.Put"), Some(3));
        assert_eq!(kinds.entry("map.Flush"), Some(2));
        assert_eq!(kinds.entry("replicatedmap.Get"), None);
    }

    #[test]
    fn empty_registry_reports_zero() {
        let mut monitor = PendingInvocationsMonitor::new(Arc::new(InvocationRegistry::new()), 1);
        let mut report = DiagnosticsReport::new();
        assert!(monitor.run(&mut report));
        assert_eq!(report.find(&[SECTION_NAME]).unwrap().entry("count"), Some(0));
        assert!(report
            .find(&[SECTION_NAME, INVOCATIONS_SECTION])
            .unwrap()
            .entries
            .is_empty());
    }

    #[test]
    fn counts_do_not_carry_over_between_runs() {
        let registry = registry_with(vec![put(), put()]);
        let mut monitor = PendingInvocationsMonitor::new(Arc::clone(&registry), 1);
        let mut first = DiagnosticsReport::new();
        assert!(monitor.run(&mut first));

        registry.deregister(1);
        let mut second = DiagnosticsReport::new();
        assert!(monitor.run(&mut second));
        let kinds = second.find(&[SECTION_NAME, INVOCATIONS_SECTION]).unwrap();
        assert_eq!(kinds.entry("replicatedmap.Put"), Some(1));
    }

    #[test]
    fn writer_failures_are_contained() {
        let registry = registry_with(vec![put()]);
        let mut monitor = PendingInvocationsMonitor::new(registry, 1);

        assert!(!monitor.run(&mut FailingWriter));
        assert!(!monitor.run(&mut PanickingWriter));

        let mut report = DiagnosticsReport::new();
        assert!(monitor.run(&mut report));
        let kinds = report.find(&[SECTION_NAME, INVOCATIONS_SECTION]).unwrap();
        assert_eq!(kinds.entry("replicatedmap.Put"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_tick_drives_the_monitor() {
        use crate::service::worker::BackgroundWorker;

        #[derive(Clone, Default)]
        struct Shared(Arc<parking_lot::Mutex<DiagnosticsReport>>);

        impl DiagnosticsWriter for Shared {
            fn start_section(&mut self, name: &str) -> anyhow::Result<()> {
                self.0.lock().start_section(name)
            }
            fn write_entry(&mut self, key: &str, value: u64) -> anyhow::Result<()> {
                self.0.lock().write_entry(key, value)
            }
            fn end_section(&mut self) -> anyhow::Result<()> {
                self.0.lock().end_section()
            }
        }

        let shared = Shared::default();
        let monitor = PendingInvocationsMonitor::new(registry_with(vec![get()]), 1);
        let mut worker = BackgroundWorker::start(
            MonitorTask::new(monitor, shared.clone()),
            Some(Duration::from_secs(1)),
        );

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        worker.stop().await;
        assert_eq!(shared.0.lock().sections().len(), 2);
    }
}
