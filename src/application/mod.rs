//! Application Layer
//!
//! Use cases of the sync engine, wired against the domain ports.

pub mod backup;
pub mod bulk_replicator;
pub mod config;
pub mod device_registry;
pub mod propagator;
pub mod quota_monitor;
pub mod sync_service;

/// Sink for progress updates of long-running operations.
pub type ProgressSender<T> = tokio::sync::mpsc::UnboundedSender<T>;

pub use backup::{validate, BackupEngine, BackupSnapshot, BackupSource, ValidationReport};
pub use bulk_replicator::{BulkReplicator, BulkReport, BulkState};
pub use config::{ConfigError, SyncConfig};
pub use device_registry::DeviceRegistry;
pub use propagator::{ConnectionState, PropagatorSettings, SyncNotification, SyncPropagator};
pub use quota_monitor::StorageQuotaMonitor;
pub use sync_service::{SyncPorts, SyncService};
