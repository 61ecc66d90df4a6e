//! Local Replica Store Port
//!
//! Defines the interface to the embedded, namespaced persistence layer that
//! holds one collection per entity type. Implementations never touch the
//! network.

use crate::domain::entities::Record;
use crate::domain::errors::StorageError;
use async_trait::async_trait;

/// Target of a clear operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    /// A single collection
    Collection(String),
    /// Every collection
    All,
}

/// Local replica of the user's data.
///
/// A store never holds two records with the same `(collection, id)`; writing
/// an existing key replaces it.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Insert or replace a record.
    async fn put(&self, store: &str, record: Record) -> Result<(), StorageError>;

    /// Fetch a record, `None` when not found.
    async fn get(&self, store: &str, id: &str) -> Result<Option<Record>, StorageError>;

    /// Insert or replace a batch of records atomically.
    async fn put_batch(&self, store: &str, records: Vec<Record>) -> Result<(), StorageError>;

    /// All records of a collection, ordered by id.
    async fn get_all(&self, store: &str) -> Result<Vec<Record>, StorageError>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, store: &str, id: &str) -> Result<bool, StorageError>;

    /// Remove every record in scope.
    async fn clear(&self, scope: ClearScope) -> Result<(), StorageError>;

    /// Number of records in a collection.
    async fn count(&self, store: &str) -> Result<usize, StorageError>;

    /// Names of collections currently holding at least one record.
    async fn collections(&self) -> Result<Vec<String>, StorageError>;
}
