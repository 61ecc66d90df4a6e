//! Storage Quota Port
//!
//! Reports how much local storage is used and how much is allowed.

use crate::domain::errors::StorageError;
use async_trait::async_trait;

/// Source of local storage usage figures.
#[async_trait]
pub trait StorageQuota: Send + Sync {
    /// Returns `(usage, quota)` in bytes. A quota of 0 means unknown.
    async fn usage_and_quota(&self) -> Result<(u64, u64), StorageError>;
}
