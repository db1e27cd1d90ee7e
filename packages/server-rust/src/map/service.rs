//! Partitioned map domain service: writes with synchronous backups and the
//! flush protocol.
//!
//! Backup traffic leaves the lane on spawned tasks. A put answers as soon as
//! the owner has applied it and tells the caller how many backup acks to
//! wait for.

use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use tower::Service;
use tracing::{debug, trace, warn};

use super::data_store::MapDataStore;
use super::record_store::MapRecordStore;
use crate::service::dispatch::OperationService;
use crate::service::operation::{
    service_names, BackupAckTarget, EntryPayload, FlushPayload, Operation, OperationContext,
    OperationError, OperationResponse,
};
use crate::service::router::OperationFuture;

pub struct MapService {
    node_id: String,
    backup_count: usize,
    stores: DashMap<(String, u32), Arc<MapRecordStore>>,
    operations: Arc<OperationService>,
    data_store: Arc<dyn MapDataStore>,
}

impl MapService {
    #[must_use]
    pub fn new(operations: Arc<OperationService>, data_store: Arc<dyn MapDataStore>) -> Self {
        Self {
            node_id: operations.node_id().to_string(),
            backup_count: operations.config().backup_count as usize,
            stores: DashMap::new(),
            operations,
            data_store,
        }
    }

    pub fn store(&self, name: &str, partition_id: u32) -> Arc<MapRecordStore> {
        Arc::clone(
            self.stores
                .entry((name.to_string(), partition_id))
                .or_insert_with(|| Arc::new(MapRecordStore::new(name, partition_id)))
                .value(),
        )
    }

    #[must_use]
    pub fn existing_store(&self, name: &str, partition_id: u32) -> Option<Arc<MapRecordStore>> {
        self.stores
            .get(&(name.to_string(), partition_id))
            .map(|e| Arc::clone(e.value()))
    }

    /// Executes one map operation on this member.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Application`] for null values,
    /// [`OperationError::Internal`] when the data store rejects a flush and
    /// [`OperationError::WrongService`] for replicated map kinds.
    pub async fn handle(&self, op: Operation) -> Result<OperationResponse, OperationError> {
        match op {
            Operation::MapPut { ctx, entry } => self.put(&ctx, entry),
            Operation::MapBackup { ctx, entry, ack } => {
                self.apply_backup(ctx.partition_id, entry, ack);
                Ok(OperationResponse::Empty)
            }
            Operation::Flush { ctx, flush } => self.flush(ctx.partition_id, &flush).await,
            other => Err(OperationError::WrongService {
                kind: other.kind(),
                service: service_names::MAP,
            }),
        }
    }

    fn put(&self, ctx: &OperationContext, entry: EntryPayload) -> Result<OperationResponse, OperationError> {
        if entry.value.is_null() {
            return Err(OperationError::Application(format!(
                "null value is not allowed in map {}",
                entry.name
            )));
        }
        let old_value = self
            .store(&entry.name, ctx.partition_id)
            .put(&entry.key, entry.value.clone());

        let backups = self.send_backups(ctx, &entry);
        let response = OperationResponse::Value(old_value);
        if backups == 0 {
            return Ok(response);
        }
        Ok(OperationResponse::AwaitBackups {
            response: Box::new(response),
            backups,
        })
    }

    /// Ships the entry to the partition's backups without waiting on them.
    /// Returns how many backup acks the caller should expect.
    fn send_backups(&self, ctx: &OperationContext, entry: &EntryPayload) -> u32 {
        let targets: Vec<String> = self
            .operations
            .partitions()
            .backups(ctx.partition_id)
            .into_iter()
            .filter(|b| *b != self.node_id)
            .take(self.backup_count)
            .collect();
        if targets.is_empty() {
            return 0;
        }

        // A one-way put has nobody waiting for acks.
        let ack = (ctx.call_id != 0).then(|| BackupAckTarget {
            node_id: ctx.caller.clone(),
            call_id: ctx.call_id,
            attempt: ctx.attempt,
        });
        let partition_id = ctx.partition_id;
        for target in &targets {
            let op = Operation::MapBackup {
                ctx: OperationContext::new(partition_id, 0),
                entry: entry.clone(),
                ack: ack.clone(),
            };
            let operations = Arc::clone(&self.operations);
            let target = target.clone();
            let ack = ack.clone();
            tokio::spawn(async move {
                let Err(err) = operations.send_oneway(&target, op).await else {
                    return;
                };
                warn!(target = %target, partition_id, error = %err, "backup not sent");
                // The owner acks on behalf of a backup it could not reach.
                if let Some(ack) = ack {
                    send_ack(&operations, ack).await;
                }
            });
        }

        match ack {
            Some(_) => u32::try_from(targets.len()).unwrap_or(u32::MAX),
            None => 0,
        }
    }

    fn apply_backup(&self, partition_id: u32, entry: EntryPayload, ack: Option<BackupAckTarget>) {
        self.store(&entry.name, partition_id)
            .put_backup(&entry.key, entry.value);
        trace!(map = %entry.name, key = %entry.key, partition_id, "backup applied");

        if let Some(ack) = ack {
            let operations = Arc::clone(&self.operations);
            tokio::spawn(async move { send_ack(&operations, ack).await });
        }
    }

    async fn flush(
        &self,
        partition_id: u32,
        flush: &FlushPayload,
    ) -> Result<OperationResponse, OperationError> {
        let Some(store) = self.existing_store(&flush.name, partition_id) else {
            return Ok(OperationResponse::Bool(true));
        };
        let candidates = store.flush_candidates(flush.flush_all);
        if candidates.is_empty() {
            return Ok(OperationResponse::Bool(true));
        }

        let entries: Vec<_> = candidates
            .iter()
            .map(|c| (c.key.clone(), c.value.clone()))
            .collect();
        self.data_store
            .store_all(&flush.name, &entries)
            .await
            .map_err(|err| {
                warn!(map = %flush.name, partition_id, error = %err, "flush failed");
                OperationError::Internal(err)
            })?;
        store.mark_clean(&candidates);
        debug!(map = %flush.name, partition_id, flushed = candidates.len(), flush_all = flush.flush_all, "partition flushed");
        Ok(OperationResponse::Bool(true))
    }
}

async fn send_ack(operations: &OperationService, ack: BackupAckTarget) {
    let BackupAckTarget {
        node_id,
        call_id,
        attempt,
    } = ack;
    if let Err(err) = operations.send_backup_ack(&node_id, call_id, attempt).await {
        debug!(call_id, caller = %node_id, error = %err, "backup ack not delivered");
    }
}

impl Service<Operation> for Arc<MapService> {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = OperationFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let service = Arc::clone(self);
        Box::pin(async move { service.handle(op).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
