//! Device Registry & Heartbeat
//!
//! Keeps this installation's identity in the settings store and its liveness
//! in the remote device registry. Stale devices are never deleted; they are
//! only left out of the active view.

use crate::domain::entities::DeviceInfo;
use crate::domain::errors::{StorageError, SyncError};
use crate::domain::ports::{RemoteStore, SettingsStore};
use crate::domain::value_objects::{now_millis, DeviceId, Platform, UserId, DAY_MS};
use crate::infrastructure::CancelHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEVICE_ID_KEY: &str = "device_id";
pub const DEVICE_NAME_KEY: &str = "device_name";

/// Read a setting, treating unreadable values as absent.
pub(crate) fn read_setting(settings: &dyn SettingsStore, key: &str) -> Option<String> {
    match settings.get(key) {
        Ok(value) => value.filter(|v| !v.trim().is_empty()),
        Err(e) => {
            tracing::warn!(key, "ignoring unreadable setting: {}", e);
            None
        }
    }
}

/// Devices whose last heartbeat is within `horizon_ms` of `now_ms`.
pub fn filter_active(devices: Vec<DeviceInfo>, now_ms: u64, horizon_ms: u64) -> Vec<DeviceInfo> {
    devices
        .into_iter()
        .filter(|d| !d.is_stale(now_ms, horizon_ms))
        .collect()
}

/// This device's entry in the user's device registry.
pub struct DeviceRegistry {
    user: UserId,
    remote: Arc<dyn RemoteStore>,
    settings: Arc<dyn SettingsStore>,
    device_id: DeviceId,
    platform: Platform,
}

impl DeviceRegistry {
    /// Load the persisted device id, generating and saving one on first launch.
    pub fn load(
        user: UserId,
        remote: Arc<dyn RemoteStore>,
        settings: Arc<dyn SettingsStore>,
        platform: Platform,
    ) -> Result<Self, SyncError> {
        let device_id = match read_setting(settings.as_ref(), DEVICE_ID_KEY) {
            Some(id) => DeviceId::new(id),
            None => {
                let id = DeviceId::generate();
                settings.set(DEVICE_ID_KEY, id.as_str())?;
                tracing::info!(device_id = %id, "generated device id");
                id
            }
        };

        Ok(Self {
            user,
            remote,
            settings,
            device_id,
            platform,
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Custom name if set, otherwise `"{platform} Device"`.
    pub fn device_name(&self) -> String {
        read_setting(self.settings.as_ref(), DEVICE_NAME_KEY)
            .unwrap_or_else(|| self.platform.default_device_name())
    }

    /// Persist a custom device name; an empty name restores the default.
    pub fn set_device_name(&self, name: &str) -> Result<(), StorageError> {
        let name = name.trim();
        if name.is_empty() {
            self.settings.remove(DEVICE_NAME_KEY)
        } else {
            self.settings.set(DEVICE_NAME_KEY, name)
        }
    }

    fn current_info(&self, now_ms: u64) -> DeviceInfo {
        DeviceInfo {
            id: self.device_id.clone(),
            user_id: self.user.clone(),
            name: self.device_name(),
            last_seen: now_ms,
            platform: self.platform,
            is_current_device: true,
        }
    }

    /// Create or refresh this device's registry entry.
    pub async fn register(&self) -> Result<DeviceInfo, SyncError> {
        let info = self.current_info(now_millis());
        self.remote.upsert_device(&self.user, &info).await?;
        tracing::info!(device_id = %info.id, name = %info.name, platform = %info.platform, "device registered");
        Ok(info)
    }

    /// Record liveness; re-registers if the entry has disappeared.
    pub async fn heartbeat(&self) -> Result<(), SyncError> {
        let known = self
            .remote
            .touch_device(&self.user, &self.device_id, now_millis())
            .await?;
        if !known {
            tracing::info!(device_id = %self.device_id, "device missing from registry, re-registering");
            self.register().await?;
        }
        tracing::debug!(device_id = %self.device_id, "heartbeat sent");
        Ok(())
    }

    /// The application came to the foreground.
    pub async fn on_foreground(&self) -> Result<(), SyncError> {
        self.heartbeat().await
    }

    /// Every device of the user, stale ones included.
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, SyncError> {
        let mut devices = self.remote.list_devices(&self.user).await?;
        for device in &mut devices {
            device.is_current_device = device.id == self.device_id;
        }
        Ok(devices)
    }

    /// Devices seen within the last `stale_days` days.
    pub async fn active_devices(&self, stale_days: u64) -> Result<Vec<DeviceInfo>, SyncError> {
        let devices = self.list_devices().await?;
        Ok(filter_active(
            devices,
            now_millis(),
            stale_days.saturating_mul(DAY_MS),
        ))
    }

    /// Send a heartbeat every `interval` until `cancel` fires.
    ///
    /// Runs on its own task; failures are logged and retried on the next tick.
    pub fn start_heartbeat(self: Arc<Self>, interval: Duration, cancel: CancelHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; registration already counts.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.heartbeat().await {
                            tracing::warn!("heartbeat failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("heartbeat stopped");
        })
    }
}
