//! Replicated map: versioned records, owner-driven replication and entry
//! events.

pub mod events;
pub mod proxy;
pub mod record_store;
pub mod service;

pub use events::{EntryEvent, EntryEventType, EntryListener, EventPublisher};
pub use proxy::{PutResult, ReplicatedMapProxy};
pub use record_store::{ReplicatedRecordStore, VersionedValue, WriteOutcome};
pub use service::ReplicatedMapService;
