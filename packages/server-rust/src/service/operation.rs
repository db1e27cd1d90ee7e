//! Operation kinds, payloads, responses and executing-side errors.
//!
//! Operations form a closed set of tagged variants. Every variant carries an
//! [`OperationContext`] and a kind-specific payload; fields shared between
//! kinds (map name, key, value, ttl) live in [`EntryPayload`].

use relaygrid_core::Value;

/// Service names used for routing operations to domain services.
pub mod service_names {
    pub const REPLICATED_MAP: &str = "replicatedmap";
    pub const MAP: &str = "map";
}

/// Factory ids group kind identifiers by owning service.
pub mod factory_ids {
    pub const REPLICATED_MAP: u16 = 1;
    pub const MAP: u16 = 2;
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Wire identifier of an operation kind. Stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindId {
    pub factory_id: u16,
    pub class_id: u16,
}

impl KindId {
    #[must_use]
    pub const fn new(factory_id: u16, class_id: u16) -> Self {
        Self {
            factory_id,
            class_id,
        }
    }
}

/// Discriminant of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Put,
    Get,
    Remove,
    Replicate,
    UpdateCaller,
    MapPut,
    MapBackup,
    Flush,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Put,
        OperationKind::Get,
        OperationKind::Remove,
        OperationKind::Replicate,
        OperationKind::UpdateCaller,
        OperationKind::MapPut,
        OperationKind::MapBackup,
        OperationKind::Flush,
    ];

    /// Wire identifier of this kind.
    #[must_use]
    pub const fn id(self) -> KindId {
        use factory_ids::{MAP, REPLICATED_MAP};
        match self {
            OperationKind::Put => KindId::new(REPLICATED_MAP, 1),
            OperationKind::Get => KindId::new(REPLICATED_MAP, 2),
            OperationKind::Remove => KindId::new(REPLICATED_MAP, 3),
            OperationKind::Replicate => KindId::new(REPLICATED_MAP, 4),
            OperationKind::UpdateCaller => KindId::new(REPLICATED_MAP, 5),
            OperationKind::MapPut => KindId::new(MAP, 1),
            OperationKind::MapBackup => KindId::new(MAP, 2),
            OperationKind::Flush => KindId::new(MAP, 3),
        }
    }

    /// Name of the domain service that executes this kind.
    #[must_use]
    pub const fn service_name(self) -> &'static str {
        match self {
            OperationKind::Put
            | OperationKind::Get
            | OperationKind::Remove
            | OperationKind::Replicate
            | OperationKind::UpdateCaller => service_names::REPLICATED_MAP,
            OperationKind::MapPut | OperationKind::MapBackup | OperationKind::Flush => {
                service_names::MAP
            }
        }
    }

    /// Identifier shown in diagnostics and metrics labels.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            OperationKind::Put => "replicatedmap.Put",
            OperationKind::Get => "replicatedmap.Get",
            OperationKind::Remove => "replicatedmap.Remove",
            OperationKind::Replicate => "replicatedmap.Replicate",
            OperationKind::UpdateCaller => "replicatedmap.UpdateCaller",
            OperationKind::MapPut => "map.Put",
            OperationKind::MapBackup => "map.Backup",
            OperationKind::Flush => "map.Flush",
        }
    }

    /// Whether only the partition owner may execute this kind.
    ///
    /// Member-targeted kinds (replication, caller updates, backups) are
    /// executed by whichever member they are sent to.
    #[must_use]
    pub const fn is_owner_targeted(self) -> bool {
        matches!(
            self,
            OperationKind::Put
                | OperationKind::Get
                | OperationKind::Remove
                | OperationKind::MapPut
                | OperationKind::Flush
        )
    }
}

// ---------------------------------------------------------------------------
// Context and payloads
// ---------------------------------------------------------------------------

/// Context carried with every operation.
///
/// `call_id`, `attempt` and `caller` are stamped by the dispatcher on the
/// calling side and restored from the packet on the executing side; a
/// `call_id` of 0 marks a fire-and-forget operation that expects no response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub call_id: u64,
    pub attempt: u32,
    pub partition_id: u32,
    pub caller: String,
    pub call_timeout_ms: u64,
}

impl OperationContext {
    /// Creates a context for `partition_id`. A `call_timeout_ms` of 0 means
    /// "use the configured default".
    #[must_use]
    pub fn new(partition_id: u32, call_timeout_ms: u64) -> Self {
        Self {
            call_id: 0,
            attempt: 0,
            partition_id,
            caller: String::new(),
            call_timeout_ms,
        }
    }
}

/// Map name, key, value and time-to-live shared by write kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPayload {
    pub name: String,
    pub key: String,
    pub value: Value,
    /// Milliseconds; zero or negative means the entry never expires.
    pub ttl_millis: i64,
}

/// Map name and key addressed by read/remove kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPayload {
    pub name: String,
    pub key: String,
}

/// A versioned record shipped to replicas. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationPayload {
    pub name: String,
    pub key: String,
    pub value: Option<Value>,
    pub version: u64,
    pub ttl_millis: i64,
}

/// Sent by the owner back to a remote caller after a replicated write.
#[derive(Debug, Clone, PartialEq)]
pub struct CallerUpdatePayload {
    pub record: ReplicationPayload,
    pub old_value: Option<Value>,
    /// Call id of the invocation waiting on the origin node.
    pub origin_call_id: u64,
}

/// Where a backup replica must send its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupAckTarget {
    pub node_id: String,
    pub call_id: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushPayload {
    pub name: String,
    pub flush_all: bool,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Typed operation variants dispatched through the invocation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Replicated map write.
    Put {
        ctx: OperationContext,
        entry: EntryPayload,
    },
    Get {
        ctx: OperationContext,
        target: KeyPayload,
    },
    Remove {
        ctx: OperationContext,
        target: KeyPayload,
    },
    /// Owner to backup, fire-and-forget.
    Replicate {
        ctx: OperationContext,
        record: ReplicationPayload,
    },
    /// Owner to remote caller, fire-and-forget.
    UpdateCaller {
        ctx: OperationContext,
        update: CallerUpdatePayload,
    },
    /// Partitioned map write with synchronous backups.
    MapPut {
        ctx: OperationContext,
        entry: EntryPayload,
    },
    MapBackup {
        ctx: OperationContext,
        entry: EntryPayload,
        ack: Option<BackupAckTarget>,
    },
    Flush {
        ctx: OperationContext,
        flush: FlushPayload,
    },
}

impl Operation {
    /// Returns a reference to the operation context.
    #[must_use]
    pub fn ctx(&self) -> &OperationContext {
        match self {
            Operation::Put { ctx, .. }
            | Operation::Get { ctx, .. }
            | Operation::Remove { ctx, .. }
            | Operation::Replicate { ctx, .. }
            | Operation::UpdateCaller { ctx, .. }
            | Operation::MapPut { ctx, .. }
            | Operation::MapBackup { ctx, .. }
            | Operation::Flush { ctx, .. } => ctx,
        }
    }

    /// Returns a mutable reference to the operation context.
    pub fn ctx_mut(&mut self) -> &mut OperationContext {
        match self {
            Operation::Put { ctx, .. }
            | Operation::Get { ctx, .. }
            | Operation::Remove { ctx, .. }
            | Operation::Replicate { ctx, .. }
            | Operation::UpdateCaller { ctx, .. }
            | Operation::MapPut { ctx, .. }
            | Operation::MapBackup { ctx, .. }
            | Operation::Flush { ctx, .. } => ctx,
        }
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Put { .. } => OperationKind::Put,
            Operation::Get { .. } => OperationKind::Get,
            Operation::Remove { .. } => OperationKind::Remove,
            Operation::Replicate { .. } => OperationKind::Replicate,
            Operation::UpdateCaller { .. } => OperationKind::UpdateCaller,
            Operation::MapPut { .. } => OperationKind::MapPut,
            Operation::MapBackup { .. } => OperationKind::MapBackup,
            Operation::Flush { .. } => OperationKind::Flush,
        }
    }

    #[must_use]
    pub fn partition_id(&self) -> u32 {
        self.ctx().partition_id
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Successful response from an operation handler.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResponse {
    /// Flush acknowledgment.
    Bool(bool),
    /// Replicated write result: previous value and the version now stored.
    Versioned {
        old_value: Option<Value>,
        version: u64,
    },
    /// Read result, or previous value of a map write.
    Value(Option<Value>),
    /// Fire-and-forget kinds.
    Empty,
    /// Handler-side marker: the caller must also wait for `backups`
    /// acknowledgments. Flattened into the response envelope by the executor
    /// and never observed by callers.
    AwaitBackups {
        response: Box<OperationResponse>,
        backups: u32,
    },
}

/// Response as it travels back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// Backup acknowledgments the caller must collect before completing.
    pub backup_acks: u32,
    pub outcome: Result<OperationResponse, RemoteFailure>,
}

impl ResponseEnvelope {
    /// Builds an envelope from a handler result.
    #[must_use]
    pub fn from_result(result: Result<OperationResponse, OperationError>) -> Self {
        match result {
            Ok(OperationResponse::AwaitBackups { response, backups }) => Self {
                backup_acks: backups,
                outcome: Ok(*response),
            },
            Ok(response) => Self {
                backup_acks: 0,
                outcome: Ok(response),
            },
            Err(err) => Self::failure(RemoteFailure::from(&err)),
        }
    }

    #[must_use]
    pub fn failure(failure: RemoteFailure) -> Self {
        Self {
            backup_acks: 0,
            outcome: Err(failure),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while executing an operation on the target member.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("partition {partition_id} is not owned by {node_id}")]
    WrongTarget { partition_id: u32, node_id: String },
    #[error("lane for partition {partition_id} is full")]
    Overloaded { partition_id: u32 },
    #[error("{0}")]
    Application(String),
    #[error("unknown service: {name}")]
    UnknownService { name: String },
    #[error("{kind:?} is not handled by service {service}")]
    WrongService {
        kind: OperationKind,
        service: &'static str,
    },
    #[error(transparent)]
    Codec(#[from] super::codec::CodecError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Failure as carried in a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteFailure {
    #[error("target does not own partition {partition_id}")]
    WrongTarget { partition_id: u32 },
    #[error("target is overloaded on partition {partition_id}")]
    Overloaded { partition_id: u32 },
    #[error("{message}")]
    Application { message: String },
    #[error("codec failure: {message}")]
    Codec { message: String },
    #[error("internal failure: {message}")]
    Internal { message: String },
}

impl RemoteFailure {
    /// Stale ownership and a full lane are worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteFailure::WrongTarget { .. } | RemoteFailure::Overloaded { .. }
        )
    }
}

impl From<&OperationError> for RemoteFailure {
    fn from(err: &OperationError) -> Self {
        match err {
            OperationError::WrongTarget { partition_id, .. } => RemoteFailure::WrongTarget {
                partition_id: *partition_id,
            },
            OperationError::Overloaded { partition_id } => RemoteFailure::Overloaded {
                partition_id: *partition_id,
            },
            OperationError::Application(message) => RemoteFailure::Application {
                message: message.clone(),
            },
            OperationError::Codec(e) => RemoteFailure::Codec {
                message: e.to_string(),
            },
            other => RemoteFailure::Internal {
                message: other.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn kind_ids_are_unique() {
        let ids: HashSet<KindId> = OperationKind::ALL.iter().map(|k| k.id()).collect();
        assert_eq!(ids.len(), OperationKind::ALL.len());
    }

    #[test]
    fn kind_names_are_unique_and_prefixed_by_service() {
        let names: HashSet<&str> = OperationKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names.len(), OperationKind::ALL.len());
        for kind in OperationKind::ALL {
            assert!(kind.name().starts_with(kind.service_name()));
        }
    }

    #[test]
    fn member_targeted_kinds() {
        assert!(OperationKind::Put.is_owner_targeted());
        assert!(OperationKind::Flush.is_owner_targeted());
        assert!(!OperationKind::Replicate.is_owner_targeted());
        assert!(!OperationKind::UpdateCaller.is_owner_targeted());
        assert!(!OperationKind::MapBackup.is_owner_targeted());
    }

    #[test]
    fn ctx_mut_stamps_call_id() {
        let mut op = Operation::Get {
            ctx: OperationContext::new(7, 0),
            target: KeyPayload {
                name: "m".to_string(),
                key: "k".to_string(),
            },
        };
        op.ctx_mut().call_id = 42;
        assert_eq!(op.ctx().call_id, 42);
        assert_eq!(op.partition_id(), 7);
        assert_eq!(op.kind(), OperationKind::Get);
    }

    #[test]
    fn envelope_flattens_backup_marker() {
        let env = ResponseEnvelope::from_result(Ok(OperationResponse::AwaitBackups {
            response: Box::new(OperationResponse::Value(None)),
            backups: 2,
        }));
        assert_eq!(env.backup_acks, 2);
        assert_eq!(env.outcome, Ok(OperationResponse::Value(None)));
    }

    #[test]
    fn ownership_and_overload_failures_are_retryable() {
        let wrong = RemoteFailure::from(&OperationError::WrongTarget {
            partition_id: 3,
            node_id: "b".to_string(),
        });
        assert!(wrong.is_retryable());
        let full = RemoteFailure::from(&OperationError::Overloaded { partition_id: 3 });
        assert_eq!(full, RemoteFailure::Overloaded { partition_id: 3 });
        assert!(full.is_retryable());

        let app = RemoteFailure::from(&OperationError::Application("type mismatch".to_string()));
        assert!(!app.is_retryable());
        assert_eq!(
            app,
            RemoteFailure::Application {
                message: "type mismatch".to_string()
            }
        );
    }
}
