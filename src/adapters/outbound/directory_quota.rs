//! Directory Storage Quota
//!
//! Reports the bytes used under the data directory against a configured quota.
//! The directory walk runs on the blocking thread pool.

use crate::domain::errors::StorageError;
use crate::domain::ports::StorageQuota;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// StorageQuota over the files of one directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryQuota {
    root: PathBuf,
    quota_bytes: u64,
}

impl DirectoryQuota {
    pub fn new(root: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            root: root.into(),
            quota_bytes,
        }
    }

    fn dir_size(path: &Path) -> std::io::Result<u64> {
        let mut total = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                total += Self::dir_size(&entry.path())?;
            } else {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl StorageQuota for DirectoryQuota {
    async fn usage_and_quota(&self) -> Result<(u64, u64), StorageError> {
        let root = self.root.clone();
        let walked = tokio::task::spawn_blocking(move || Self::dir_size(&root))
            .await
            .map_err(|e| StorageError::Io(format!("spawn_blocking error: {:?}", e)))?;

        let usage = match walked {
            Ok(size) => size,
            // Nothing written yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        Ok((usage, self.quota_bytes))
    }
}

/// Fixed usage and quota, for tests and previews.
#[derive(Debug, Clone, Copy)]
pub struct StaticQuota {
    pub usage: u64,
    pub quota: u64,
}

#[async_trait]
impl StorageQuota for StaticQuota {
    async fn usage_and_quota(&self) -> Result<(u64, u64), StorageError> {
        Ok((self.usage, self.quota))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.db"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/b.db"), vec![0u8; 50]).unwrap();

        let quota = DirectoryQuota::new(dir.path(), 1_000);
        assert_eq!(quota.usage_and_quota().await.unwrap(), (150, 1_000));
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let quota = DirectoryQuota::new(dir.path().join("not-created"), 10);
        assert_eq!(quota.usage_and_quota().await.unwrap(), (0, 10));
    }
}
