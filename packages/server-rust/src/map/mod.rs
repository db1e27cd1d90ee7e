//! Partitioned map with synchronous backups and flushing to a data store.

pub mod data_store;
pub mod proxy;
pub mod record_store;
pub mod service;

pub use data_store::{InMemoryDataStore, MapDataStore, NullDataStore};
pub use proxy::MapProxy;
pub use record_store::{FlushCandidate, MapRecordStore};
pub use service::MapService;
