use crate::adapters::outbound::{Credentials, HttpRemoteConfig};
use crate::application::config::SyncConfig;
use crate::domain::value_objects::DAY_MS;
use crate::infrastructure::RetryConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Local storage
    pub data_dir: String,
    pub storage_quota_mb: u64,

    // Remote store
    pub api_url: String,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,

    // Sync engine
    pub heartbeat_interval_secs: u64,
    pub stale_device_days: u64,
    pub max_event_age_days: u64,
    pub page_size: usize,
    pub restore_batch_size: usize,
    pub storage_threshold_percent: u8,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            storage_quota_mb: 512,
            api_url: "http://localhost:8080".to_string(),
            api_key: None,
            access_token: None,
            user_id: None,
            poll_interval_ms: 2000,
            request_timeout_secs: 30,
            heartbeat_interval_secs: 300,
            stale_device_days: 7,
            max_event_age_days: 7,
            page_size: 100,
            restore_batch_size: 50,
            storage_threshold_percent: 90,
            debug: false,
        }
    }
}

impl Config {
    pub fn replica_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("replica.db")
    }

    pub fn settings_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("settings.db")
    }

    pub fn storage_quota_bytes(&self) -> u64 {
        self.storage_quota_mb.saturating_mul(1024 * 1024)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::from_parts(self.api_key.clone(), self.access_token.clone())
    }

    pub fn remote(&self) -> HttpRemoteConfig {
        HttpRemoteConfig {
            base_url: self.api_url.clone(),
            credentials: self.credentials(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Engine settings for the configured user (empty when unset).
    pub fn sync(&self) -> SyncConfig {
        SyncConfig::new(self.user_id.clone().unwrap_or_default())
            .heartbeat_interval(Duration::from_secs(self.heartbeat_interval_secs))
            .stale_device_days(self.stale_device_days)
            .max_event_age(Duration::from_millis(
                self.max_event_age_days.saturating_mul(DAY_MS),
            ))
            .page_size(self.page_size)
            .restore_batch_size(self.restore_batch_size)
            .storage_threshold_percent(self.storage_threshold_percent)
            .reconnect(RetryConfig::daemon())
    }
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_config() -> anyhow::Result<Config> {
    let data_dir = std::env::var("OFFLINE_SYNC_DATA_DIR")
        .unwrap_or_else(|_| "./data".to_string());

    let storage_quota_mb = std::env::var("OFFLINE_SYNC_STORAGE_QUOTA_MB")
        .unwrap_or_else(|_| "512".to_string())
        .parse()
        .unwrap_or(512);

    let api_url = std::env::var("OFFLINE_SYNC_API_URL")
        .unwrap_or_else(|_| "http://localhost:8080".to_string());

    let api_key = non_empty("OFFLINE_SYNC_API_KEY");
    let access_token = non_empty("OFFLINE_SYNC_ACCESS_TOKEN");
    let user_id = non_empty("OFFLINE_SYNC_USER_ID");

    let poll_interval_ms = std::env::var("OFFLINE_SYNC_POLL_INTERVAL_MS")
        .unwrap_or_else(|_| "2000".to_string())
        .parse()
        .unwrap_or(2000);

    let request_timeout_secs = std::env::var("OFFLINE_SYNC_REQUEST_TIMEOUT_SECS")
        .unwrap_or_else(|_| "30".to_string())
        .parse()
        .unwrap_or(30);

    let heartbeat_interval_secs = std::env::var("OFFLINE_SYNC_HEARTBEAT_INTERVAL_SECS")
        .unwrap_or_else(|_| "300".to_string())
        .parse()
        .unwrap_or(300);

    let stale_device_days = std::env::var("OFFLINE_SYNC_STALE_DEVICE_DAYS")
        .unwrap_or_else(|_| "7".to_string())
        .parse()
        .unwrap_or(7);

    let max_event_age_days = std::env::var("OFFLINE_SYNC_MAX_EVENT_AGE_DAYS")
        .unwrap_or_else(|_| "7".to_string())
        .parse()
        .unwrap_or(7);

    let page_size = std::env::var("OFFLINE_SYNC_PAGE_SIZE")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(100);

    let restore_batch_size = std::env::var("OFFLINE_SYNC_RESTORE_BATCH_SIZE")
        .unwrap_or_else(|_| "50".to_string())
        .parse()
        .unwrap_or(50);

    let storage_threshold_percent = std::env::var("OFFLINE_SYNC_STORAGE_THRESHOLD_PERCENT")
        .unwrap_or_else(|_| "90".to_string())
        .parse()
        .unwrap_or(90);

    let debug = std::env::var("DEBUG").is_ok();

    Ok(Config {
        data_dir,
        storage_quota_mb,
        api_url,
        api_key,
        access_token,
        user_id,
        poll_interval_ms,
        request_timeout_secs,
        heartbeat_interval_secs,
        stale_device_days,
        max_event_age_days,
        page_size,
        restore_batch_size,
        storage_threshold_percent,
        debug,
    })
}
