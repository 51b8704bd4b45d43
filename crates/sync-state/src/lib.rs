//! PostgreSQL-backed `ConfigStore` and `StateStore`, plus the
//! `StateStoreApi` trait surface that lets `sync-engine` run its tests
//! against an in-memory double.

pub mod config_store;
pub mod models;
pub mod state_store;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config_store::ConfigStore;
pub use models::{ConfigChange, DataSourceConfig, DocumentState, ProcessDecision, SyncStatus};
pub use state_store::{compute_content_hash, compute_ordinal, StateStore};
pub use traits::StateStoreApi;

#[cfg(any(test, feature = "testing"))]
pub use testing::InMemoryStateStore;
