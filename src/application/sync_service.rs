//! Sync Service - Main application use case
//!
//! Facade over the sync components: the surface the UI or the CLI drives.
//! It owns the session gate and the enable/disable lifecycle, and wires every
//! component to the same ports and write locks.

use crate::application::backup::{BackupEngine, BackupSnapshot, BackupSource};
use crate::application::bulk_replicator::{BulkReplicator, BulkReport};
use crate::application::config::SyncConfig;
use crate::application::device_registry::DeviceRegistry;
use crate::application::propagator::{
    ConnectionState, PropagatorSettings, SyncNotification, SyncPropagator,
};
use crate::application::quota_monitor::StorageQuotaMonitor;
use crate::application::ProgressSender;
use crate::domain::entities::{
    BulkStage, ConflictReport, DeviceInfo, DownloadProgress, RestoreHistory, RestoreProgress,
    RestoreResult, StorageEstimate, SyncEvent, SyncStats,
};
use crate::domain::errors::{StorageError, SyncError};
use crate::domain::ports::{RemoteStore, ReplicaStore, SettingsStore, StorageQuota};
use crate::domain::services::resolve;
use crate::domain::value_objects::{DeviceId, Operation, Platform};
use crate::infrastructure::{retry, CancelHandle, RetryConfig, WriteLocks};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// The outbound ports a [`SyncService`] runs against.
#[derive(Clone)]
pub struct SyncPorts {
    pub remote: Arc<dyn RemoteStore>,
    pub replica: Arc<dyn ReplicaStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub quota: Arc<dyn StorageQuota>,
}

/// Background work alive while sync is enabled.
struct Session {
    heartbeat_cancel: CancelHandle,
    heartbeat: JoinHandle<()>,
}

/// Public entry point of the sync engine.
pub struct SyncService {
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    replica: Arc<dyn ReplicaStore>,
    locks: Arc<WriteLocks>,
    quota: StorageQuotaMonitor,
    registry: Arc<DeviceRegistry>,
    bulk: BulkReplicator,
    propagator: SyncPropagator,
    backup: BackupEngine,
    signed_in: AtomicBool,
    session: Mutex<Option<Session>>,
}

impl SyncService {
    /// Wire the components. Loads (or generates) this device's id.
    pub fn new(config: SyncConfig, ports: SyncPorts, platform: Platform) -> Result<Self, SyncError> {
        config.validate()?;

        let locks = Arc::new(WriteLocks::new());
        let quota = StorageQuotaMonitor::new(ports.quota.clone());
        let registry = Arc::new(DeviceRegistry::load(
            config.user_id.clone(),
            ports.remote.clone(),
            ports.settings.clone(),
            platform,
        )?);

        let bulk = BulkReplicator::new(
            config.user_id.clone(),
            ports.remote.clone(),
            ports.replica.clone(),
            locks.clone(),
            quota.clone(),
            config.page_size,
            config.storage_threshold_percent,
            RetryConfig::query(),
        );
        let propagator = SyncPropagator::new(
            PropagatorSettings::from_config(&config, registry.device_id().clone()),
            ports.remote.clone(),
            ports.replica.clone(),
            locks.clone(),
        );
        let backup = BackupEngine::new(
            config.user_id.clone(),
            ports.remote.clone(),
            ports.replica.clone(),
            ports.settings.clone(),
            locks.clone(),
            config.restore_batch_size,
            RetryConfig::query(),
        );

        tracing::info!(
            user_id = %config.user_id,
            device_id = %registry.device_id(),
            "sync service ready"
        );

        Ok(Self {
            config,
            remote: ports.remote,
            replica: ports.replica,
            locks,
            quota,
            registry,
            bulk,
            propagator,
            backup,
            signed_in: AtomicBool::new(false),
            session: Mutex::new(None),
        })
    }

    /// Mark the session as authenticated.
    pub fn sign_in(&self) {
        self.signed_in.store(true, Ordering::SeqCst);
    }

    /// Drop the session, disabling sync first.
    pub async fn sign_out(&self) {
        self.disable().await;
        self.signed_in.store(false, Ordering::SeqCst);
    }

    pub fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::SeqCst)
    }

    fn require_session(&self) -> Result<(), SyncError> {
        if self.is_signed_in() {
            Ok(())
        } else {
            Err(SyncError::AuthenticationRequired)
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub fn device_id(&self) -> &DeviceId {
        self.registry.device_id()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.propagator.state()
    }

    /// Take the notification receiver (only once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SyncNotification>> {
        self.propagator.take_event_rx()
    }

    /// Register this device, populate the replica and go live.
    ///
    /// Returns `None` when sync was already enabled.
    pub async fn enable(
        &self,
        cancel: &CancelHandle,
        progress: Option<&ProgressSender<DownloadProgress>>,
    ) -> Result<Option<BulkReport>, SyncError> {
        self.require_session()?;

        let mut session = self.session.lock().await;
        if session.is_some() {
            tracing::info!("sync already enabled");
            return Ok(None);
        }

        self.registry.register().await?;
        // Writes queued while offline reach the remote before it is downloaded.
        if let Err(e) = self.propagator.flush().await {
            tracing::warn!("outbox flush before download failed: {}", e);
        }
        let report = self.bulk.run(cancel, progress).await?;

        self.propagator.start();
        let heartbeat_cancel = CancelHandle::new();
        let heartbeat = self
            .registry
            .clone()
            .start_heartbeat(self.config.heartbeat_interval, heartbeat_cancel.clone());
        *session = Some(Session {
            heartbeat_cancel,
            heartbeat,
        });

        tracing::info!(items = report.items_downloaded, "sync enabled");
        Ok(Some(report))
    }

    /// Stop live sync and the heartbeat. No-op when not enabled.
    pub async fn disable(&self) {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            return;
        };

        self.propagator.stop().await;
        active.heartbeat_cancel.cancel();
        if let Err(e) = active.heartbeat.await {
            tracing::error!("heartbeat task failed: {}", e);
        }
        tracing::info!("sync disabled");
    }

    /// Re-run the bulk download without touching the live subscription.
    pub async fn refresh(
        &self,
        cancel: &CancelHandle,
        progress: Option<&ProgressSender<DownloadProgress>>,
    ) -> Result<BulkReport, SyncError> {
        self.require_session()?;
        self.bulk.run(cancel, progress).await
    }

    /// Flush queued local events and pull missed remote ones.
    pub async fn sync_now(&self) -> Result<SyncStats, SyncError> {
        self.require_session()?;
        self.propagator.sync_now().await?;
        Ok(self.stats().await)
    }

    /// Apply a local mutation and propagate it to the other devices.
    pub async fn record_mutation(
        &self,
        store: &str,
        operation: Operation,
        item_id: &str,
        data: Option<Value>,
    ) -> Result<SyncEvent, SyncError> {
        self.propagator
            .record_mutation(store, operation, item_id, data)
            .await
    }

    /// Apply a local mutation stamped with `timestamp` (milliseconds).
    pub async fn record_mutation_at(
        &self,
        store: &str,
        operation: Operation,
        item_id: &str,
        data: Option<Value>,
        timestamp: u64,
    ) -> Result<SyncEvent, SyncError> {
        self.propagator
            .record_mutation_at(store, operation, item_id, data, timestamp)
            .await
    }

    /// Items whose local and remote timestamps disagree, with the side the
    /// conflict rule would pick. Read-only.
    pub async fn detect_conflicts(&self) -> Result<Vec<ConflictReport>, SyncError> {
        self.require_session()?;

        let cancel = CancelHandle::new();
        let retry_config = RetryConfig::query();
        let page_size = self.config.page_size;
        let mut conflicts = Vec::new();

        for stage in BulkStage::DOWNLOAD_ORDER {
            let Some(collection) = stage.collection() else {
                continue;
            };
            let _shared = self.locks.read_collection(collection).await;
            let mut offset = 0;

            loop {
                let page = retry(
                    &format!("fetch {}", collection),
                    &retry_config,
                    &cancel,
                    || {
                        self.remote
                            .fetch_page(&self.config.user_id, collection, offset, page_size)
                    },
                )
                .await?;
                let fetched = page.len();

                for remote in page {
                    let Some(local) = self.replica.get(collection, &remote.id).await? else {
                        continue;
                    };
                    if local.last_modified != remote.last_modified {
                        conflicts.push(ConflictReport {
                            store: collection.to_string(),
                            item_id: remote.id,
                            local_timestamp: local.last_modified,
                            remote_timestamp: remote.last_modified,
                            winner: resolve(local.last_modified, remote.last_modified),
                        });
                    }
                }

                offset += fetched;
                if fetched < page_size {
                    break;
                }
            }
        }

        tracing::info!(count = conflicts.len(), "conflict detection finished");
        Ok(conflicts)
    }

    /// Replace the replica's backed-up collections with a backup.
    pub async fn restore(
        &self,
        source: BackupSource,
        cancel: &CancelHandle,
        progress: Option<&ProgressSender<RestoreProgress>>,
    ) -> Result<RestoreResult, SyncError> {
        if matches!(source, BackupSource::Remote(_)) {
            self.require_session()?;
        }
        self.backup.restore(source, cancel, progress).await
    }

    /// Snapshot the replica, optionally storing the snapshot remotely.
    pub async fn export_backup(&self, upload: bool) -> Result<BackupSnapshot, SyncError> {
        let snapshot = self.backup.export().await?;
        if upload {
            self.require_session()?;
            self.backup.upload(&snapshot).await?;
        }
        Ok(snapshot)
    }

    pub fn history(&self) -> RestoreHistory {
        self.backup.history()
    }

    /// Counters with a fresh count of active devices when reachable.
    pub async fn stats(&self) -> SyncStats {
        if self.is_signed_in() {
            match self.registry.active_devices(self.config.stale_device_days).await {
                Ok(devices) => self.propagator.set_connected_devices(devices.len()),
                Err(e) => tracing::debug!("keeping last device count: {}", e),
            }
        }
        self.propagator.stats()
    }

    pub fn reset_stats(&self) {
        self.propagator.reset_stats();
    }

    /// Every device of the user, stale ones included.
    pub async fn devices(&self) -> Result<Vec<DeviceInfo>, SyncError> {
        self.require_session()?;
        self.registry.list_devices().await
    }

    /// Devices seen within the configured staleness horizon.
    pub async fn active_devices(&self) -> Result<Vec<DeviceInfo>, SyncError> {
        self.require_session()?;
        self.registry
            .active_devices(self.config.stale_device_days)
            .await
    }

    pub fn device_name(&self) -> String {
        self.registry.device_name()
    }

    pub fn set_device_name(&self, name: &str) -> Result<(), StorageError> {
        self.registry.set_device_name(name)
    }

    /// Heartbeat immediately when the application comes to the foreground.
    pub async fn on_foreground(&self) -> Result<(), SyncError> {
        if !self.is_enabled().await {
            return Ok(());
        }
        self.registry.on_foreground().await
    }

    pub async fn storage_estimate(&self) -> Result<StorageEstimate, StorageError> {
        self.quota.estimate().await
    }
}
