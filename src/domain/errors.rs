//! Error Taxonomy
//!
//! Storage-level failures are reported as [`StorageError`]; everything surfaced
//! to callers of the sync engine is a [`SyncError`].

use crate::application::config::ConfigError;

/// Failure of a local persistence layer (replica or settings).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The device ran out of space or the configured quota was hit.
    #[error("local storage exhausted: {0}")]
    Exhausted(String),
    /// Persisted data could not be decoded.
    #[error("local storage corrupted: {0}")]
    Corruption(String),
    /// Any other failure of the storage engine.
    #[error("local storage failure: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::DiskFull => Self::Exhausted(e.to_string()),
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    Self::Corruption(e.to_string())
                }
                _ => Self::Io(e.to_string()),
            },
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => Self::Corruption(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corruption(e.to_string())
    }
}

/// Errors surfaced by the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Sync was enabled without an authenticated session.
    #[error("authentication required")]
    AuthenticationRequired,

    /// Quota check failed before or during a bulk write.
    #[error("storage exhausted: {0}")]
    StorageExhausted(String),

    /// Malformed backup, rejected before any destructive action.
    #[error("backup validation failed: {0}")]
    ValidationFailed(String),

    /// Remote store unreachable or temporarily failing.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The remote store refused the request; resending it cannot succeed.
    #[error("rejected by remote store: {0}")]
    Rejected(String),

    /// Locally persisted settings could not be read.
    #[error("corrupted local data: {0}")]
    Corruption(String),

    /// Local store failure other than exhaustion.
    #[error(transparent)]
    Storage(StorageError),

    /// The run was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A long-running operation of the same kind is already in progress.
    #[error("{0} already in progress")]
    AlreadyRunning(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Only transport failures are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Exhausted(msg) => Self::StorageExhausted(msg),
            other => Self::Storage(other),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_maps_to_storage_exhausted() {
        let err: SyncError = StorageError::Exhausted("quota".to_string()).into();
        assert!(matches!(err, SyncError::StorageExhausted(msg) if msg == "quota"));
    }

    #[test]
    fn test_other_storage_errors_are_wrapped() {
        let err: SyncError = StorageError::Corruption("bad row".to_string()).into();
        assert!(matches!(err, SyncError::Storage(StorageError::Corruption(_))));
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(SyncError::Transport("timeout".to_string()).is_retryable());
        assert!(!SyncError::AuthenticationRequired.is_retryable());
        assert!(!SyncError::ValidationFailed("x".to_string()).is_retryable());
        assert!(!SyncError::StorageExhausted("x".to_string()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Rejected("422".to_string()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(SyncError::AuthenticationRequired.to_string(), "authentication required");
        assert_eq!(
            SyncError::AlreadyRunning("restore").to_string(),
            "restore already in progress"
        );
    }

    #[test]
    fn test_json_error_is_corruption() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StorageError = json_err.into();
        assert!(matches!(err, StorageError::Corruption(_)));
    }
}
