//! In-Memory Settings Store

use crate::domain::errors::StorageError;
use crate::domain::ports::SettingsStore;
use dashmap::DashMap;

/// DashMap-backed settings, lost on drop.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: DashMap<String, String>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values.remove(key);
        Ok(())
    }
}
