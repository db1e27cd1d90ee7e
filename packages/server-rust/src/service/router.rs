//! Routes operations to domain services by the service name of their kind.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::Service;

use super::operation::{Operation, OperationError, OperationResponse};

pub type OperationFuture =
    Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

type BoxedService = Box<
    dyn Service<Operation, Response = OperationResponse, Error = OperationError, Future = OperationFuture>
        + Send,
>;

/// Dispatches each operation to the service registered for
/// `op.kind().service_name()`.
///
/// Every partition lane owns its own router, so registered services are
/// called from one task at a time per lane.
#[derive(Default)]
pub struct OperationRouter {
    services: HashMap<&'static str, BoxedService>,
}

impl OperationRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `name`, replacing any previous one.
    pub fn register<S>(&mut self, name: &'static str, service: S)
    where
        S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send + 'static,
        S::Future: Send + 'static,
    {
        self.services.insert(name, Box::new(Erased(service)));
    }

    /// Builder form of [`OperationRouter::register`].
    #[must_use]
    pub fn with<S>(mut self, name: &'static str, service: S) -> Self
    where
        S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send + 'static,
        S::Future: Send + 'static,
    {
        self.register(name, service);
        self
    }

    #[must_use]
    pub fn handles(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }
}

impl Service<Operation> for OperationRouter {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = OperationFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        for svc in self.services.values_mut() {
            match svc.poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let name = op.kind().service_name();
        match self.services.get_mut(name) {
            Some(svc) => svc.call(op),
            None => Box::pin(async move {
                Err(OperationError::UnknownService {
                    name: name.to_string(),
                })
            }),
        }
    }
}

/// Boxes the future of a concrete service.
struct Erased<S>(S);

impl<S> Service<Operation> for Erased<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = OperationFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        Box::pin(self.0.call(op))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::service::operation::{service_names, FlushPayload, KeyPayload, OperationContext};

    /// Answers every operation with the service it was routed to.
    struct Echo(&'static str);

    impl Service<Operation> for Echo {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future = OperationFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _op: Operation) -> Self::Future {
            let name = self.0;
            Box::pin(async move { Ok(OperationResponse::Value(Some(name.into()))) })
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

    #[tokio::test]
    async fn routes_by_kind_service_name() {
        let mut router = OperationRouter::new()
            .with(service_names::REPLICATED_MAP, Echo("rm"))
            .with(service_names::MAP, Echo("map"));

        let resp = router.ready().await.unwrap().call(get()).await.unwrap();
        assert_eq!(resp, OperationResponse::Value(Some("rm".into())));

        let resp = router.ready().await.unwrap().call(flush()).await.unwrap();
        assert_eq!(resp, OperationResponse::Value(Some("map".into())));
    }

    #[tokio::test]
    async fn unregistered_service_rejected() {
        let router = OperationRouter::new().with(service_names::MAP, Echo("map"));
        assert!(!router.handles(service_names::REPLICATED_MAP));

        let err = router.oneshot(get()).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::UnknownService { name } if name == service_names::REPLICATED_MAP
        ));
    }
}
