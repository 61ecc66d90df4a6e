//! Settings Store Port
//!
//! Small scalar key-value persistence for device identity and restore history.

use crate::domain::errors::StorageError;

/// Local scalar settings, loaded at startup and saved on change.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}
