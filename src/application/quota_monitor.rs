//! Storage Quota Monitor

use crate::domain::entities::StorageEstimate;
use crate::domain::errors::{StorageError, SyncError};
use crate::domain::ports::StorageQuota;
use std::sync::Arc;

/// Turns raw usage figures into estimates and a go/no-go for bulk writes.
#[derive(Clone)]
pub struct StorageQuotaMonitor {
    quota: Arc<dyn StorageQuota>,
}

impl StorageQuotaMonitor {
    pub fn new(quota: Arc<dyn StorageQuota>) -> Self {
        Self { quota }
    }

    pub async fn estimate(&self) -> Result<StorageEstimate, StorageError> {
        let (usage, quota) = self.quota.usage_and_quota().await?;
        Ok(StorageEstimate::from_usage(usage, quota))
    }

    /// Fail with `StorageExhausted` when usage is above `threshold_percent`.
    ///
    /// An unknown quota (0) never blocks.
    pub async fn ensure_capacity(
        &self,
        threshold_percent: u8,
    ) -> Result<StorageEstimate, SyncError> {
        let estimate = self.estimate().await?;
        if estimate.usage_percent > u32::from(threshold_percent) {
            tracing::warn!(
                usage = estimate.usage,
                quota = estimate.quota,
                "storage at {}% exceeds threshold of {}%",
                estimate.usage_percent,
                threshold_percent
            );
            return Err(SyncError::StorageExhausted(format!(
                "{}% of local storage used, threshold is {}%",
                estimate.usage_percent, threshold_percent
            )));
        }
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::StaticQuota;

    fn monitor(usage: u64, quota: u64) -> StorageQuotaMonitor {
        StorageQuotaMonitor::new(Arc::new(StaticQuota { usage, quota }))
    }

    #[tokio::test]
    async fn test_estimate_half_used() {
        let estimate = monitor(50, 100).estimate().await.unwrap();
        assert_eq!(estimate.usage_percent, 50);
        assert_eq!(estimate.available, 50);
    }

    #[tokio::test]
    async fn test_estimate_unknown_quota() {
        assert_eq!(monitor(50, 0).estimate().await.unwrap().usage_percent, 0);
        assert!(monitor(50, 0).ensure_capacity(10).await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_capacity_threshold() {
        assert!(monitor(90, 100).ensure_capacity(90).await.is_ok());
        assert!(matches!(
            monitor(91, 100).ensure_capacity(90).await,
            Err(SyncError::StorageExhausted(_))
        ));
    }
}
