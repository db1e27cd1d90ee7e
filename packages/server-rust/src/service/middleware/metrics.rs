//! Metrics middleware for operations.
//!
//! Wraps every execution in a `tracing` span and records counters and a
//! duration histogram through the `metrics` facade, labelled by kind.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{debug_span, Instrument};

use crate::service::operation::{Operation, OperationError, OperationResponse};

/// Tower layer that instruments operations with timing and outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Operation> for MetricsService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let kind = op.kind().name();
        let call_id = op.ctx().call_id;
        let partition_id = op.ctx().partition_id;

        let span = debug_span!(
            "operation",
            kind,
            call_id,
            partition_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(op);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(OperationError::WrongTarget { .. }) => "wrong_target",
                    Err(OperationError::Application(_)) => "application_error",
                    Err(_) => "error",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                metrics::counter!("relaygrid_operations_total", "kind" => kind, "outcome" => outcome)
                    .increment(1);
                metrics::histogram!("relaygrid_operation_duration_seconds", "kind" => kind)
                    .record(elapsed.as_secs_f64());

                tracing::debug!(kind, call_id, duration_ms, outcome, "operation complete");
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
