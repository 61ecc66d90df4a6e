//! In-Memory Replica Store
//!
//! Implements ReplicaStore using DashMap for lock-free concurrent access.
//! Optionally enforces a record capacity, reported as storage exhaustion.

use crate::domain::entities::Record;
use crate::domain::errors::StorageError;
use crate::domain::ports::{ClearScope, ReplicaStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// DashMap-backed local replica.
#[derive(Default)]
pub struct MemoryReplicaStore {
    collections: DashMap<String, BTreeMap<String, Record>>,
    max_records: Option<usize>,
    writes: AtomicU64,
}

impl MemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that refuses writes once `max_records` records are held.
    pub fn with_capacity_limit(max_records: usize) -> Self {
        Self {
            max_records: Some(max_records),
            ..Self::default()
        }
    }

    /// Number of mutating calls (put, put_batch, delete, clear) seen so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn total_records(&self) -> usize {
        self.collections.iter().map(|c| c.value().len()).sum()
    }

    /// Reject a write that would grow the store beyond capacity.
    fn ensure_capacity(&self, store: &str, records: &[Record]) -> Result<(), StorageError> {
        let Some(max) = self.max_records else {
            return Ok(());
        };
        let new_keys = match self.collections.get(store) {
            Some(existing) => records
                .iter()
                .filter(|r| !existing.contains_key(&r.id))
                .count(),
            None => records.len(),
        };
        if self.total_records() + new_keys > max {
            return Err(StorageError::Exhausted(format!(
                "capacity of {} records reached",
                max
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplicaStore {
    async fn put(&self, store: &str, record: Record) -> Result<(), StorageError> {
        self.put_batch(store, vec![record]).await
    }

    async fn get(&self, store: &str, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self
            .collections
            .get(store)
            .and_then(|c| c.value().get(id).cloned()))
    }

    async fn put_batch(&self, store: &str, records: Vec<Record>) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.ensure_capacity(store, &records)?;

        let mut collection = self.collections.entry(store.to_string()).or_default();
        for record in records {
            collection.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Record>, StorageError> {
        Ok(self
            .collections
            .get(store)
            .map(|c| c.value().values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, store: &str, id: &str) -> Result<bool, StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .collections
            .get_mut(store)
            .map(|mut c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn clear(&self, scope: ClearScope) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        match scope {
            ClearScope::Collection(store) => {
                self.collections.remove(&store);
            }
            ClearScope::All => self.collections.clear(),
        }
        Ok(())
    }

    async fn count(&self, store: &str) -> Result<usize, StorageError> {
        Ok(self.collections.get(store).map(|c| c.len()).unwrap_or(0))
    }

    async fn collections(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self
            .collections
            .iter()
            .filter(|c| !c.value().is_empty())
            .map(|c| c.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
