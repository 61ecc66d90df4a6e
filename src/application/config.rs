//! Sync Configuration
//!
//! Tunables of the sync engine for one signed-in user.

use crate::domain::value_objects::{UserId, DAY_MS};
use crate::infrastructure::RetryConfig;
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Signed-in account whose namespace is replicated
    pub user_id: UserId,

    /// Heartbeat period (default: 5 minutes)
    pub heartbeat_interval: Duration,

    /// Devices silent for longer are not active (default: 7 days)
    pub stale_device_days: u64,

    /// Remote events older than this are dropped (default: 7 days)
    pub max_event_age: Duration,

    /// Documents fetched per page during bulk download (default: 100)
    pub page_size: usize,

    /// Records written per batch during restore (default: 50)
    pub restore_batch_size: usize,

    /// Bulk download refuses to start above this usage (default: 90%)
    pub storage_threshold_percent: u8,

    /// Sync tokens remembered for duplicate suppression (default: 4096)
    pub seen_token_capacity: usize,

    /// Backoff for re-opening a dropped subscription
    pub reconnect: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_id: UserId::new(""),
            heartbeat_interval: Duration::from_secs(300),
            stale_device_days: 7,
            max_event_age: Duration::from_millis(7 * DAY_MS),
            page_size: 100,
            restore_batch_size: 50,
            storage_threshold_percent: 90,
            seen_token_capacity: 4096,
            reconnect: RetryConfig::daemon(),
        }
    }
}

impl SyncConfig {
    /// Create a new configuration for a user.
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn stale_device_days(mut self, days: u64) -> Self {
        self.stale_device_days = days;
        self
    }

    pub fn max_event_age(mut self, age: Duration) -> Self {
        self.max_event_age = age;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn restore_batch_size(mut self, size: usize) -> Self {
        self.restore_batch_size = size;
        self
    }

    pub fn storage_threshold_percent(mut self, percent: u8) -> Self {
        self.storage_threshold_percent = percent;
        self
    }

    pub fn seen_token_capacity(mut self, capacity: usize) -> Self {
        self.seen_token_capacity = capacity;
        self
    }

    pub fn reconnect(mut self, retry: RetryConfig) -> Self {
        self.reconnect = retry;
        self
    }

    /// Staleness horizon in milliseconds.
    pub fn stale_horizon_ms(&self) -> u64 {
        self.stale_device_days.saturating_mul(DAY_MS)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_id.as_str().is_empty() {
            return Err(ConfigError::MissingUserId);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        if self.restore_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.storage_threshold_percent > 100 {
            return Err(ConfigError::InvalidThreshold(self.storage_threshold_percent));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("user_id is required")]
    MissingUserId,
    #[error("heartbeat_interval must be greater than zero")]
    ZeroHeartbeatInterval,
    #[error("page_size must be greater than zero")]
    ZeroPageSize,
    #[error("restore_batch_size must be greater than zero")]
    ZeroBatchSize,
    #[error("storage threshold {0}% is above 100%")]
    InvalidThreshold(u8),
    #[error("credentials contain characters not allowed in a header")]
    InvalidCredentials,
}
