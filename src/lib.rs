//! offline-sync Library
//!
//! Offline-first multi-device synchronization engine: a local replica kept
//! consistent with a remote authoritative store, real-time propagation between
//! a user's devices, device liveness tracking and snapshot backup/restore.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{
    BackupSnapshot, BackupSource, ConnectionState, SyncConfig, SyncNotification, SyncPorts,
    SyncService,
};
pub use config::load_config;
pub use domain::entities::{
    ConflictReport, DeviceInfo, DownloadProgress, Record, RestoreHistory, RestoreProgress,
    RestoreResult, StorageEstimate, SyncEvent, SyncStats,
};
pub use domain::errors::{StorageError, SyncError};
pub use domain::ports::{RemoteStore, ReplicaStore, SettingsStore, StorageQuota};
pub use domain::value_objects::{DeviceId, Operation, Platform, UserId};
pub use infrastructure::CancelHandle;
