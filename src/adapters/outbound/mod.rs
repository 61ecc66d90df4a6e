//! Outbound Adapters
//!
//! Implementations of the domain ports: local replica and settings
//! persistence, remote store clients and the storage quota check.

mod directory_quota;
mod http_remote_store;
mod memory_remote_store;
mod memory_replica_store;
mod memory_settings_store;
mod sqlite_replica_store;
mod sqlite_settings_store;

pub use directory_quota::{DirectoryQuota, StaticQuota};
pub use http_remote_store::{Credentials, HttpRemoteConfig, HttpRemoteStore};
pub use memory_remote_store::MemoryRemoteStore;
pub use memory_replica_store::MemoryReplicaStore;
pub use memory_settings_store::MemorySettingsStore;
pub use sqlite_replica_store::SqliteReplicaStore;
pub use sqlite_settings_store::SqliteSettingsStore;
