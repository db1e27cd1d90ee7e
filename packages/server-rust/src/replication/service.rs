//! Replicated map domain service: the versioned put protocol.
//!
//! On the partition owner a write is applied synchronously and answered with
//! `(old_value, version)`. A remote caller is additionally sent an
//! `UpdateCaller` operation carrying the same pair, which races the regular
//! response; whichever arrives first completes the caller's invocation.
//! Replication to backups is a detached task the write never waits for, and
//! entry listeners fire once replication has been dispatched.

use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::future::join_all;
use relaygrid_core::Value;
use tower::Service;
use tracing::{debug, trace, warn};

use super::events::{EntryEvent, EntryEventType, EntryListener, EventPublisher};
use super::record_store::{ReplicatedRecordStore, WriteOutcome};
use crate::service::dispatch::OperationService;
use crate::service::invocation_registry::RegistryError;
use crate::service::operation::{
    service_names, CallerUpdatePayload, EntryPayload, KeyPayload, Operation, OperationContext,
    OperationError, OperationResponse, ReplicationPayload,
};

pub struct ReplicatedMapService {
    node_id: String,
    backup_count: usize,
    stores: DashMap<(String, u32), Arc<ReplicatedRecordStore>>,
    operations: Arc<OperationService>,
    events: EventPublisher,
}

impl ReplicatedMapService {
    #[must_use]
    pub fn new(operations: Arc<OperationService>) -> Self {
        Self {
            node_id: operations.node_id().to_string(),
            backup_count: operations.config().backup_count as usize,
            stores: DashMap::new(),
            operations,
            events: EventPublisher::new(),
        }
    }

    /// Record store for `(name, partition_id)`, created on first use.
    pub fn store(&self, name: &str, partition_id: u32) -> Arc<ReplicatedRecordStore> {
        Arc::clone(
            self.stores
                .entry((name.to_string(), partition_id))
                .or_insert_with(|| Arc::new(ReplicatedRecordStore::new(name, partition_id)))
                .value(),
        )
    }

    #[must_use]
    pub fn existing_store(&self, name: &str, partition_id: u32) -> Option<Arc<ReplicatedRecordStore>> {
        self.stores
            .get(&(name.to_string(), partition_id))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn add_listener(&self, listener: Arc<dyn EntryListener>) {
        self.events.add_listener(listener);
    }

    /// Executes one replicated map operation on this member.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Application`] for null values and
    /// [`OperationError::WrongService`] for kinds owned by other services.
    pub fn handle(&self, op: Operation) -> Result<OperationResponse, OperationError> {
        match op {
            Operation::Put { ctx, entry } => self.put(&ctx, entry),
            Operation::Get { ctx, target } => Ok(OperationResponse::Value(
                self.existing_store(&target.name, ctx.partition_id)
                    .and_then(|store| store.get(&target.key)),
            )),
            Operation::Remove { ctx, target } => Ok(self.remove(&ctx, &target)),
            Operation::Replicate { ctx, record } => {
                self.apply_record(ctx.partition_id, &record);
                Ok(OperationResponse::Empty)
            }
            Operation::UpdateCaller { ctx, update } => {
                self.update_caller(ctx.partition_id, update);
                Ok(OperationResponse::Empty)
            }
            other => Err(OperationError::WrongService {
                kind: other.kind(),
                service: service_names::REPLICATED_MAP,
            }),
        }
    }

    fn put(
        &self,
        ctx: &OperationContext,
        entry: EntryPayload,
    ) -> Result<OperationResponse, OperationError> {
        if entry.value.is_null() {
            return Err(OperationError::Application(format!(
                "null value is not allowed in replicated map {}",
                entry.name
            )));
        }
        let EntryPayload {
            name,
            key,
            value,
            ttl_millis,
        } = entry;

        let store = self.store(&name, ctx.partition_id);
        let WriteOutcome { old_value, version } = store.put(&key, value.clone(), ttl_millis);
        trace!(map = %name, key = %key, version, partition_id = ctx.partition_id, "replicated put applied");

        let event = EntryEvent::for_put(&name, &key, old_value.clone(), value.clone(), &ctx.caller);
        let record = ReplicationPayload {
            name,
            key,
            value: Some(value),
            version,
            ttl_millis,
        };
        self.finish_write(ctx, record, old_value.clone());
        self.events.publish(&event);
        Ok(OperationResponse::Versioned { old_value, version })
    }

    fn remove(&self, ctx: &OperationContext, target: &KeyPayload) -> OperationResponse {
        let store = self.store(&target.name, ctx.partition_id);
        let Some(WriteOutcome { old_value, version }) = store.remove(&target.key) else {
            return OperationResponse::Versioned {
                old_value: None,
                version: store.version_of(&target.key),
            };
        };

        let record = ReplicationPayload {
            name: target.name.clone(),
            key: target.key.clone(),
            value: None,
            version,
            ttl_millis: 0,
        };
        self.finish_write(ctx, record, old_value.clone());
        self.events.publish(&EntryEvent {
            map_name: target.name.clone(),
            key: target.key.clone(),
            old_value: old_value.clone(),
            new_value: None,
            event_type: EntryEventType::Removed,
            origin: ctx.caller.clone(),
        });
        OperationResponse::Versioned { old_value, version }
    }

    /// Sends the caller update (remote callers only) and replicates to backups.
    fn finish_write(&self, ctx: &OperationContext, record: ReplicationPayload, old_value: Option<Value>) {
        if !ctx.caller.is_empty() && ctx.caller != self.node_id {
            let update = Operation::UpdateCaller {
                ctx: OperationContext::new(ctx.partition_id, 0),
                update: CallerUpdatePayload {
                    record: record.clone(),
                    old_value,
                    origin_call_id: ctx.call_id,
                },
            };
            let operations = Arc::clone(&self.operations);
            let caller = ctx.caller.clone();
            tokio::spawn(async move {
                if let Err(err) = operations.send_oneway(&caller, update).await {
                    debug!(caller = %caller, error = %err, "caller update not delivered");
                }
            });
        }
        self.replicate(ctx.partition_id, record);
    }

    /// Ships `record` to the partition's backups without waiting.
    fn replicate(&self, partition_id: u32, record: ReplicationPayload) {
        let targets: Vec<String> = self
            .operations
            .partitions()
            .backups(partition_id)
            .into_iter()
            .filter(|b| *b != self.node_id)
            .take(self.backup_count)
            .collect();
        if targets.is_empty() {
            return;
        }

        let operations = Arc::clone(&self.operations);
        tokio::spawn(async move {
            let sends = targets.iter().map(|target| {
                let op = Operation::Replicate {
                    ctx: OperationContext::new(partition_id, 0),
                    record: record.clone(),
                };
                let operations = Arc::clone(&operations);
                async move { (target, operations.send_oneway(target, op).await) }
            });
            for (target, result) in join_all(sends).await {
                if let Err(err) = result {
                    warn!(target = %target, key = %record.key, version = record.version, error = %err, "replication failed");
                }
            }
        });
    }

    fn apply_record(&self, partition_id: u32, record: &ReplicationPayload) -> bool {
        let applied = self.store(&record.name, partition_id).apply_replica(
            &record.key,
            record.value.clone(),
            record.version,
            record.ttl_millis,
        );
        trace!(map = %record.name, key = %record.key, version = record.version, applied, "replica record");
        applied
    }

    /// Origin side of the caller update: merge, then complete the waiting call.
    fn update_caller(&self, partition_id: u32, update: CallerUpdatePayload) {
        self.apply_record(partition_id, &update.record);
        let response = OperationResponse::Versioned {
            old_value: update.old_value,
            version: update.record.version,
        };
        match self
            .operations
            .complete_from_caller_update(update.origin_call_id, response)
        {
            Ok(()) => trace!(call_id = update.origin_call_id, "completed by caller update"),
            Err(RegistryError::NotFound(call_id)) => {
                trace!(call_id, "caller update after regular response");
            }
            Err(err) => debug!(error = %err, "caller update rejected"),
        }
    }
}

impl Service<Operation> for Arc<ReplicatedMapService> {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Ready<Result<OperationResponse, OperationError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        ready(self.handle(op))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
