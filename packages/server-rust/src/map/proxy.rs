//! Caller-facing handle for one partitioned map.

use std::sync::Arc;

use futures_util::future::try_join_all;
use relaygrid_core::Value;

use crate::service::dispatch::OperationService;
use crate::service::invocation::InvocationError;
use crate::service::operation::{
    EntryPayload, FlushPayload, Operation, OperationContext, OperationResponse,
};

#[derive(Clone)]
pub struct MapProxy {
    name: String,
    operations: Arc<OperationService>,
}

impl MapProxy {
    #[must_use]
    pub fn new(name: impl Into<String>, operations: Arc<OperationService>) -> Self {
        Self {
            name: name.into(),
            operations,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes `key` and waits until the owner and every announced backup have
    /// applied it. Returns the previous value.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`InvocationError`] of the underlying call.
    pub async fn put(&self, key: &str, value: Value) -> Result<Option<Value>, InvocationError> {
        let op = Operation::MapPut {
            ctx: OperationContext::new(self.operations.partitions().partition_id(key), 0),
            entry: EntryPayload {
                name: self.name.clone(),
                key: key.to_string(),
                value,
                ttl_millis: 0,
            },
        };
        match self.operations.invoke(op).await? {
            OperationResponse::Value(old) => Ok(old),
            other => Err(InvocationError::Internal(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    /// Flushes dirty records of every partition to the data store.
    ///
    /// # Errors
    ///
    /// Returns the first failing partition's [`InvocationError`].
    pub async fn flush(&self) -> Result<(), InvocationError> {
        self.flush_partitions(false).await
    }

    /// Flushes every record, dirty or not, of every partition.
    ///
    /// # Errors
    ///
    /// Returns the first failing partition's [`InvocationError`].
    pub async fn flush_all(&self) -> Result<(), InvocationError> {
        self.flush_partitions(true).await
    }

    async fn flush_partitions(&self, flush_all: bool) -> Result<(), InvocationError> {
        let calls = (0..self.operations.partitions().partition_count()).map(|partition_id| {
            let op = Operation::Flush {
                ctx: OperationContext::new(partition_id, 0),
                flush: FlushPayload {
                    name: self.name.clone(),
                    flush_all,
                },
            };
            self.operations.invoke(op)
        });
        for response in try_join_all(calls).await? {
            if response != OperationResponse::Bool(true) {
                return Err(InvocationError::Internal(format!(
                    "unexpected flush response: {response:?}"
                )));
            }
        }
        Ok(())
    }
}
