//! Assembly of one cluster member.
//!
//! A [`Node`] owns the dispatching side ([`OperationService`] plus the
//! invocation sweeper), the executing side (partition lanes behind an
//! [`OperationExecutor`]), both domain services and the optional pending
//! invocations monitor. Membership and the transport are supplied by the
//! caller.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cluster::PartitionService;
use crate::map::{MapDataStore, MapProxy, MapService};
use crate::monitor::{LogDiagnosticsWriter, MonitorTask, PendingInvocationsMonitor};
use crate::network::{InboundPacket, Transport};
use crate::replication::{ReplicatedMapProxy, ReplicatedMapService};
use crate::service::codec::OperationCodec;
use crate::service::config::ServerConfig;
use crate::service::dispatch::OperationService;
use crate::service::executor::OperationExecutor;
use crate::service::invocation_registry::InvocationRegistry;
use crate::service::lanes::PartitionLanes;
use crate::service::middleware::build_lane_pipeline;
use crate::service::operation::service_names;
use crate::service::router::OperationRouter;
use crate::service::sweeper::InvocationSweeper;
use crate::service::worker::BackgroundWorker;

pub struct Node {
    operations: Arc<OperationService>,
    replicated: Arc<ReplicatedMapService>,
    maps: Arc<MapService>,
    executor: Option<Arc<OperationExecutor>>,
    inbound: Option<JoinHandle<()>>,
    sweeper: BackgroundWorker<InvocationSweeper>,
    monitor: Option<BackgroundWorker<MonitorTask<LogDiagnosticsWriter>>>,
}

impl Node {
    /// Wires a member and starts consuming `inbound`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        config: ServerConfig,
        partitions: Arc<dyn PartitionService>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundPacket>,
        data_store: Arc<dyn MapDataStore>,
    ) -> Self {
        let config = Arc::new(config);
        let codec = Arc::new(OperationCodec::new());
        let operations = Arc::new(OperationService::new(
            Arc::clone(&config),
            Arc::clone(&partitions),
            Arc::clone(&transport),
            Arc::clone(&codec),
        ));

        let replicated = Arc::new(ReplicatedMapService::new(Arc::clone(&operations)));
        let maps = Arc::new(MapService::new(Arc::clone(&operations), data_store));
        let lanes = PartitionLanes::start(config.lane_count, |_| {
            build_lane_pipeline(
                OperationRouter::new()
                    .with(service_names::REPLICATED_MAP, Arc::clone(&replicated))
                    .with(service_names::MAP, Arc::clone(&maps)),
            )
        });

        let executor = Arc::new(OperationExecutor::new(
            codec,
            partitions,
            transport,
            Arc::clone(&operations),
            lanes,
        ));
        let inbound = Arc::clone(&executor).spawn_inbound(inbound);

        let sweeper = BackgroundWorker::start(
            InvocationSweeper::new(Arc::clone(&operations)),
            Some(config.sweep_interval()),
        );
        let monitor = config.monitor_period().map(|period| {
            let monitor = PendingInvocationsMonitor::new(
                Arc::clone(operations.registry()),
                config.monitor_threshold,
            );
            BackgroundWorker::start(
                MonitorTask::new(monitor, LogDiagnosticsWriter::new()),
                Some(period),
            )
        });

        info!(
            node_id = %config.node_id,
            partitions = config.partition_count,
            backups = config.backup_count,
            lanes = config.lane_count,
            monitor = monitor.is_some(),
            monitor_period_secs = config.monitor_period_secs,
            monitor_threshold = config.monitor_threshold,
            "node started"
        );

        Self {
            operations,
            replicated,
            maps,
            executor: Some(executor),
            inbound: Some(inbound),
            sweeper,
            monitor,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        self.operations.node_id()
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        self.operations.config()
    }

    #[must_use]
    pub fn operations(&self) -> &Arc<OperationService> {
        &self.operations
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<InvocationRegistry> {
        self.operations.registry()
    }

    #[must_use]
    pub fn replicated_map_service(&self) -> &Arc<ReplicatedMapService> {
        &self.replicated
    }

    #[must_use]
    pub fn map_service(&self) -> &Arc<MapService> {
        &self.maps
    }

    #[must_use]
    pub fn replicated_map(&self, name: &str) -> ReplicatedMapProxy {
        ReplicatedMapProxy::new(name, Arc::clone(&self.operations))
    }

    #[must_use]
    pub fn map(&self, name: &str) -> MapProxy {
        MapProxy::new(name, Arc::clone(&self.operations))
    }

    #[must_use]
    pub fn monitor_running(&self) -> bool {
        self.monitor.as_ref().is_some_and(BackgroundWorker::is_running)
    }

    /// Stops inbound processing, drains the lanes and background workers,
    /// then fails every outstanding invocation. Returns how many were
    /// abandoned.
    pub async fn shutdown(mut self) -> usize {
        if let Some(inbound) = self.inbound.take() {
            inbound.abort();
            let _ = inbound.await;
        }
        if let Some(executor) = self.executor.take() {
            match Arc::try_unwrap(executor) {
                Ok(mut executor) => executor.stop().await,
                Err(_) => debug!(node_id = %self.node_id(), "executor still shared; lanes stop on drop"),
            }
        }
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        self.sweeper.stop().await;

        let abandoned = self.operations.abandon_all();
        info!(node_id = %self.node_id(), abandoned, "node stopped");
        abandoned
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use parking_lot::Mutex;
    use relaygrid_core::Value;

    use super::*;
    use crate::cluster::{compute_assignment, ClusterPartitionTable, MemberInfo};
    use crate::map::InMemoryDataStore;
    use crate::network::{LinkFault, LocalNetwork};
    use crate::replication::{EntryEvent, EntryEventType, EntryListener, PutResult};
    use crate::service::invocation::{AttemptFailure, InvocationError};
    use crate::service::invocation_registry::RegistryError;
    use crate::service::operation::{
        EntryPayload, Operation, OperationContext, OperationResponse, ResponseEnvelope,
    };

    const PARTITIONS: u32 = 16;

    struct Cluster {
        network: Arc<LocalNetwork>,
        table: Arc<ClusterPartitionTable>,
        nodes: HashMap<String, Node>,
        stores: HashMap<String, Arc<InMemoryDataStore>>,
    }

    impl Cluster {
        /// Members sharing one partition table assigned round-robin.
        fn start(ids: &[&str], backup_count: u32, tune: impl Fn(&mut ServerConfig)) -> Self {
            let network = LocalNetwork::new();
            let table = Arc::new(ClusterPartitionTable::new(PARTITIONS));
            let members: Vec<MemberInfo> = ids.iter().map(|id| MemberInfo::active(*id)).collect();
            table.apply_assignments(&compute_assignment(&members, PARTITIONS, backup_count));

            let mut nodes = HashMap::new();
            let mut stores = HashMap::new();
            for id in ids {
                let (transport, rx) = network.join(id);
                let store = Arc::new(InMemoryDataStore::new());
                let mut config = ServerConfig {
                    partition_count: PARTITIONS,
                    backup_count,
                    lane_count: 4,
                    sweep_interval_ms: 20,
                    ..ServerConfig::for_node(*id)
                };
                tune(&mut config);
                let node = Node::start(config, table.clone(), transport, rx, store.clone());
                nodes.insert((*id).to_string(), node);
                stores.insert((*id).to_string(), store);
            }
            Self {
                network,
                table,
                nodes,
                stores,
            }
        }

        fn node(&self, id: &str) -> &Node {
            &self.nodes[id]
        }

        /// A key whose partition is owned by `owner`.
        fn key_owned_by(&self, owner: &str) -> (String, u32) {
            (0..10_000)
                .map(|i| format!("key-{i}"))
                .find_map(|key| {
                    let pid = self.table.partition_id(&key);
                    (self.table.owner(pid).as_deref() == Some(owner)).then_some((key, pid))
                })
                .unwrap()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn put_op(pid: u32, key: &str, value: Value) -> Operation {
        Operation::Put {
            ctx: OperationContext::new(pid, 0),
            entry: EntryPayload {
                name: "m".to_string(),
                key: key.to_string(),
                value,
                ttl_millis: 0,
            },
        }
    }

    /// Formatted log output kept in memory.
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<EntryEvent>>);

    impl EntryListener for Collect {
        fn on_entry(&self, event: &EntryEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[tokio::test]
    async fn single_member_put_starts_at_version_one() {
        let cluster = Cluster::start(&["a"], 0, |_| {});
        let map = cluster.node("a").replicated_map("m");

        let first = map.put("k", Value::from("v")).await.unwrap();
        assert_eq!(
            first,
            PutResult {
                old_value: None,
                version: 1
            }
        );
        let second = map.put("k", Value::from("w")).await.unwrap();
        assert_eq!(second.old_value, Some(Value::from("v")));
        assert_eq!(second.version, 2);
        assert_eq!(map.get("k").await.unwrap(), Some(Value::from("w")));
        assert!(cluster.node("a").registry().is_empty());
    }

    #[tokio::test]
    async fn remote_put_replicates_to_backups_and_origin() {
        let cluster = Cluster::start(&["a", "b", "c"], 2, |_| {});
        let (key, pid) = cluster.key_owned_by("b");

        let result = cluster
            .node("a")
            .replicated_map("m")
            .put(&key, Value::Int(7))
            .await
            .unwrap();
        assert_eq!(
            result,
            PutResult {
                old_value: None,
                version: 1
            }
        );

        for id in ["a", "b", "c"] {
            let service = Arc::clone(cluster.node(id).replicated_map_service());
            let key = key.clone();
            eventually(move || service.store("m", pid).version_of(&key) == 1).await;
        }
        let value = cluster.node("c").replicated_map("m").get(&key).await.unwrap();
        assert_eq!(value, Some(Value::Int(7)));
        assert!(cluster.node("a").registry().is_empty());
    }

    #[tokio::test]
    async fn null_put_fails_without_retry() {
        let cluster = Cluster::start(&["a", "b"], 1, |_| {});
        let (key, _) = cluster.key_owned_by("b");
        let err = cluster
            .node("a")
            .replicated_map("m")
            .put(&key, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Application(_)));
    }

    #[tokio::test]
    async fn silent_owner_times_out_and_deregisters() {
        let cluster = Cluster::start(&["a", "b"], 0, |config| {
            config.call_timeout_ms = 300;
            config.try_timeout_ms = 10_000;
            config.max_retries = 100;
        });
        let (key, pid) = cluster.key_owned_by("b");
        cluster.network.set_fault("b", LinkFault::BlackHole);

        let a = cluster.node("a");
        let future = a.operations().dispatch(put_op(pid, &key, Value::Int(1))).await;
        let call_id = future.call_id();
        assert!(a.registry().contains(call_id));

        let err = future.await.unwrap_err();
        assert_eq!(
            err,
            InvocationError::Timeout {
                call_id,
                timeout_ms: 300
            }
        );
        assert!(!a.registry().contains(call_id));

        // A response arriving after the timeout is dropped.
        let late = ResponseEnvelope::from_result(Ok(OperationResponse::Versioned {
            old_value: None,
            version: 1,
        }));
        assert_eq!(
            a.operations().notify_response(call_id, 0, late),
            Err(RegistryError::NotFound(call_id))
        );
    }

    #[tokio::test]
    async fn unreachable_owner_exhausts_retries() {
        let cluster = Cluster::start(&["a", "b"], 0, |config| {
            config.max_retries = 2;
            config.retry_pause_ms = 1;
        });
        let (key, _) = cluster.key_owned_by("b");
        cluster.network.set_fault("b", LinkFault::Unreachable);

        let err = cluster
            .node("a")
            .replicated_map("m")
            .put(&key, Value::Int(1))
            .await
            .unwrap_err();
        let InvocationError::RetriesExhausted { cause, .. } = err else {
            panic!("expected retries to run out, got {err:?}");
        };
        assert_eq!(
            cause,
            AttemptFailure::Unreachable {
                target: "b".to_string()
            }
        );
    }

    #[tokio::test]
    async fn wrong_target_is_retried_against_new_owner() {
        // Per-member tables: "b" already knows partition ownership moved to
        // "a"; "a" learns it only after the first attempt went out.
        let network = LocalNetwork::new();
        let a_table = Arc::new(ClusterPartitionTable::new(1));
        let b_table = Arc::new(ClusterPartitionTable::new(1));
        a_table.set_owner(0, "b".to_string(), vec![]);
        b_table.set_owner(0, "a".to_string(), vec![]);

        let config = |id: &str| ServerConfig {
            partition_count: 1,
            backup_count: 0,
            retry_pause_ms: 50,
            ..ServerConfig::for_node(id)
        };
        let (a_transport, a_rx) = network.join("a");
        let (b_transport, b_rx) = network.join("b");
        let a = Node::start(
            config("a"),
            a_table.clone(),
            a_transport,
            a_rx,
            Arc::new(InMemoryDataStore::new()),
        );
        let b = Node::start(
            config("b"),
            b_table,
            b_transport,
            b_rx,
            Arc::new(InMemoryDataStore::new()),
        );

        let future = a.operations().dispatch(put_op(0, "k", Value::Int(3))).await;
        a_table.set_owner(0, "a".to_string(), vec![]);

        let resp = future.await.unwrap();
        assert_eq!(
            resp,
            OperationResponse::Versioned {
                old_value: None,
                version: 1
            }
        );
        assert_eq!(a.replicated_map_service().store("m", 0).version_of("k"), 1);
        assert!(b.replicated_map_service().existing_store("m", 0).is_none());
    }

    #[tokio::test]
    async fn map_put_waits_for_backup_then_flushes() {
        let cluster = Cluster::start(&["a", "b"], 1, |_| {});
        let (key, pid) = cluster.key_owned_by("b");
        let map = cluster.node("a").map("m");

        assert_eq!(map.put(&key, Value::Int(1)).await.unwrap(), None);
        // Completion implies the backup on "a" applied the record.
        let backup = cluster
            .node("a")
            .map_service()
            .existing_store("m", pid)
            .unwrap();
        assert_eq!(backup.get(&key), Some(Value::Int(1)));
        assert!(!backup.is_dirty(&key));

        assert_eq!(map.put(&key, Value::Int(2)).await.unwrap(), Some(Value::Int(1)));
        map.flush().await.unwrap();

        let persisted = cluster.stores["b"].entries("m");
        assert_eq!(persisted.get(&key), Some(&Value::Int(2)));
        assert!(cluster.stores["a"].entries("m").is_empty());
        let owner = cluster
            .node("b")
            .map_service()
            .existing_store("m", pid)
            .unwrap();
        assert_eq!(owner.dirty_count(), 0);
    }

    #[tokio::test]
    async fn map_put_completes_when_backup_is_unreachable() {
        let cluster = Cluster::start(&["a", "b", "c"], 1, |_| {});
        let (key, pid, backup) = (0..10_000)
            .map(|i| format!("key-{i}"))
            .find_map(|key| {
                let pid = cluster.table.partition_id(&key);
                let backup = cluster.table.backups(pid).into_iter().next()?;
                (cluster.table.owner(pid).as_deref() == Some("b") && backup != "a")
                    .then_some((key, pid, backup))
            })
            .unwrap();
        cluster.network.set_fault(&backup, LinkFault::Unreachable);

        let map = cluster.node("a").map("m");
        let put = tokio::time::timeout(Duration::from_secs(2), map.put(&key, Value::Int(1)))
            .await
            .unwrap();
        assert_eq!(put.unwrap(), None);
        let owner = cluster
            .node("b")
            .map_service()
            .existing_store("m", pid)
            .unwrap();
        assert_eq!(owner.get(&key), Some(Value::Int(1)));
        assert!(cluster
            .node(&backup)
            .map_service()
            .existing_store("m", pid)
            .is_none());
    }

    #[tokio::test]
    async fn owner_fires_entry_events() {
        let cluster = Cluster::start(&["a", "b"], 1, |_| {});
        let (key, _) = cluster.key_owned_by("b");
        let listener = Arc::new(Collect::default());
        cluster
            .node("b")
            .replicated_map_service()
            .add_listener(listener.clone());

        let map = cluster.node("a").replicated_map("m");
        map.put(&key, Value::Int(1)).await.unwrap();
        map.put(&key, Value::Int(2)).await.unwrap();
        map.remove(&key).await.unwrap();

        // The caller update can complete the call before the owner publishes.
        let seen = Arc::clone(&listener);
        eventually(move || seen.0.lock().len() == 3).await;
        let events = listener.0.lock();
        let types: Vec<EntryEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EntryEventType::Added,
                EntryEventType::Updated,
                EntryEventType::Removed
            ]
        );
        assert!(events.iter().all(|e| e.origin == "a"));
    }

    #[tokio::test]
    async fn startup_log_carries_monitor_settings() {
        let captured = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .finish();
        let _cluster = tracing::subscriber::with_default(subscriber, || {
            Cluster::start(&["a"], 0, |config| {
                config.monitor_period_secs = 5;
                config.monitor_threshold = 3;
            })
        });

        let log = captured.text();
        assert!(log.contains("node started"), "{log}");
        assert!(log.contains("monitor_period_secs=5"), "{log}");
        assert!(log.contains("monitor_threshold=3"), "{log}");
    }

    #[tokio::test]
    async fn monitor_follows_configured_period() {
        let cluster = Cluster::start(&["a", "b"], 0, |config| {
            if config.node_id == "a" {
                config.monitor_period_secs = 1;
            }
        });
        assert!(cluster.node("a").monitor_running());
        assert!(!cluster.node("b").monitor_running());
    }

    #[tokio::test]
    async fn shutdown_abandons_pending_invocations() {
        let mut cluster = Cluster::start(&["a", "b"], 0, |_| {});
        let (key, pid) = cluster.key_owned_by("b");
        cluster.network.set_fault("b", LinkFault::BlackHole);

        let a = cluster.nodes.remove("a").unwrap();
        let future = a.operations().dispatch(put_op(pid, &key, Value::Int(1))).await;
        let call_id = future.call_id();

        assert_eq!(a.shutdown().await, 1);
        assert_eq!(future.await, Err(InvocationError::Abandoned { call_id }));
    }
}
