//! Pipeline composition for one partition lane.

use tower::util::BoxService;
use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use crate::service::lanes::LaneService;
use crate::service::router::OperationRouter;

/// Wraps `router` with the lane middleware stack and boxes it.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` records timing and outcome around the handler.
#[must_use]
pub fn build_lane_pipeline(router: OperationRouter) -> LaneService {
    BoxService::new(ServiceBuilder::new().layer(MetricsLayer).service(router))
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use relaygrid_core::Value;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::service::operation::{
        service_names, KeyPayload, Operation, OperationContext, OperationError,
        OperationResponse,
    };

    struct Constant;

    impl Service<Operation> for Constant {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _op: Operation) -> Self::Future {
            Box::pin(async { Ok(OperationResponse::Value(Some(Value::Int(1)))) })
        }
    }

    #[tokio::test]
    async fn pipeline_reaches_router() {
        let router = OperationRouter::new().with(service_names::REPLICATED_MAP, Constant);
        let op = Operation::Get {
            ctx: OperationContext::new(3, 0),
            target: KeyPayload {
                name: "m".to_string(),
                key: "k".to_string(),
            },
        };
        let resp = build_lane_pipeline(router).oneshot(op).await.unwrap();
        assert_eq!(resp, OperationResponse::Value(Some(Value::Int(1))));
    }
}
