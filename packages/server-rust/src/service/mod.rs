//! Partition-aware invocation framework.
//!
//! Dispatching side:
//!
//! 1. **Operations** (`operation`, `codec`): typed operations, their wire form
//!    and the response envelope
//! 2. **Invocations** (`invocation`, `invocation_registry`): per-call state
//!    machine and the call-id correlation table
//! 3. **Dispatch** (`dispatch`, `sweeper`): target resolution, retries,
//!    completion paths and the timeout sweep
//!
//! Executing side:
//!
//! 4. **Execution** (`executor`, `lanes`): ownership check and one serial
//!    lane per partition group
//! 5. **Middleware** (`middleware`): Tower layers around each lane
//! 6. **Routing** (`router`): dispatch to domain services by `service_name`
//! 7. **Background workers** (`worker`): task queue plus periodic tick

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod invocation;
pub mod invocation_registry;
pub mod lanes;
pub mod middleware;
pub mod operation;
pub mod router;
pub mod sweeper;
pub mod worker;

pub use codec::{CodecError, OperationCodec};
pub use config::ServerConfig;
pub use dispatch::{OperationService, SweepOutcome};
pub use executor::OperationExecutor;
pub use invocation::{
    AttemptFailure, Invocation, InvocationError, InvocationFuture, InvocationResult,
    InvocationState, InvocationTarget,
};
pub use invocation_registry::{InvocationRegistry, RegistryError};
pub use lanes::PartitionLanes;
pub use operation::{
    service_names, Operation, OperationContext, OperationError, OperationKind, OperationResponse,
    RemoteFailure, ResponseEnvelope,
};
pub use router::OperationRouter;
pub use worker::{BackgroundRunnable, BackgroundWorker};
