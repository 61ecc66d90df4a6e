//! Write Serialization
//!
//! Writers to the same `(collection, item)` never interleave, while writers
//! to different collections proceed independently:
//!
//! - bulk writers (replicator, restore) hold a collection exclusively;
//! - record writers (propagator) share the collection and hold the key.
//!
//! Lock order is always collection before key.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type Key = (String, String);

/// Per-collection and per-key locks over the local replica.
#[derive(Default)]
pub struct WriteLocks {
    collections: DashMap<String, Arc<RwLock<()>>>,
    keys: Arc<DashMap<Key, Arc<Mutex<()>>>>,
}

impl WriteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, store: &str) -> Arc<RwLock<()>> {
        self.collections
            .entry(store.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Exclusive access to a whole collection.
    pub async fn lock_collection(&self, store: &str) -> OwnedRwLockWriteGuard<()> {
        self.collection(store).write_owned().await
    }

    /// Shared access to a collection; excludes bulk writers only.
    pub async fn read_collection(&self, store: &str) -> OwnedRwLockReadGuard<()> {
        self.collection(store).read_owned().await
    }

    /// Exclusive access to one record; shares the collection with other keys.
    pub async fn lock_key(&self, store: &str, id: &str) -> KeyGuard {
        let collection = self.collection(store).read_owned().await;
        let key = (store.to_string(), id.to_string());
        let mutex = self
            .keys
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;

        KeyGuard {
            key: Some(guard),
            collection: Some(collection),
            id: key,
            keys: self.keys.clone(),
        }
    }

    /// Number of key locks currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }
}

/// Held while a single record is read, resolved and written.
pub struct KeyGuard {
    key: Option<OwnedMutexGuard<()>>,
    collection: Option<OwnedRwLockReadGuard<()>>,
    id: Key,
    keys: Arc<DashMap<Key, Arc<Mutex<()>>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.key.take();
        // Only the map still references an idle lock.
        self.keys
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
        self.collection.take();
    }
}
