//! SQLite Replica Store
//!
//! Implements ReplicaStore on an embedded SQLite database. All collections
//! share one table keyed by `(collection, item_id)`, so a collection is a
//! key range. Blocking calls run on the blocking thread pool.

use crate::domain::entities::Record;
use crate::domain::errors::StorageError;
use crate::domain::ports::{ClearScope, ReplicaStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Arc;

/// SQLite-backed local replica.
pub struct SqliteReplicaStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReplicaStore {
    /// Open (or create) the replica database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    /// Open an in-memory database (used by tests and previews).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS replica_records (
                collection TEXT NOT NULL,
                item_id TEXT NOT NULL,
                last_modified INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (collection, item_id)
             );",
        )?;

        tracing::debug!("replica store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Io(format!("spawn_blocking error: {:?}", e)))?
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<(String, i64, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    }

    fn decode((id, last_modified, data): (String, i64, String)) -> Result<Record, StorageError> {
        Ok(Record {
            id,
            last_modified: last_modified.max(0) as u64,
            data: serde_json::from_str(&data)?,
        })
    }

    fn encode(record: &Record) -> Result<String, StorageError> {
        serde_json::to_string(&record.data).map_err(|e| StorageError::Io(e.to_string()))
    }
}

#[async_trait]
impl ReplicaStore for SqliteReplicaStore {
    async fn put(&self, store: &str, record: Record) -> Result<(), StorageError> {
        let store = store.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO replica_records (collection, item_id, last_modified, data)
                 VALUES (?, ?, ?, ?)",
                params![store, record.id, record.last_modified as i64, Self::encode(&record)?],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, store: &str, id: &str) -> Result<Option<Record>, StorageError> {
        let store = store.to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, last_modified, data FROM replica_records
                 WHERE collection = ? AND item_id = ?",
            )?;
            let mut rows = stmt.query_map(params![store, id], |row| Self::row_to_record(row))?;
            let first = rows.next();
            match first {
                Some(row) => Ok(Some(Self::decode(row?)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put_batch(&self, store: &str, records: Vec<Record>) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let store = store.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO replica_records (collection, item_id, last_modified, data)
                     VALUES (?, ?, ?, ?)",
                )?;
                for record in &records {
                    stmt.execute(params![
                        store,
                        record.id,
                        record.last_modified as i64,
                        Self::encode(record)?
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Record>, StorageError> {
        let store = store.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, last_modified, data FROM replica_records
                 WHERE collection = ? ORDER BY item_id",
            )?;
            let rows = stmt
                .query_map([&store], |row| Self::row_to_record(row))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(Self::decode).collect()
        })
        .await
    }

    async fn delete(&self, store: &str, id: &str) -> Result<bool, StorageError> {
        let store = store.to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM replica_records WHERE collection = ? AND item_id = ?",
                params![store, id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn clear(&self, scope: ClearScope) -> Result<(), StorageError> {
        self.with_conn(move |conn| {
            match scope {
                ClearScope::Collection(store) => {
                    conn.execute("DELETE FROM replica_records WHERE collection = ?", [&store])?
                }
                ClearScope::All => conn.execute("DELETE FROM replica_records", [])?,
            };
            Ok(())
        })
        .await
    }

    async fn count(&self, store: &str) -> Result<usize, StorageError> {
        let store = store.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM replica_records WHERE collection = ?",
                [&store],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    async fn collections(&self) -> Result<Vec<String>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT collection FROM replica_records ORDER BY collection",
            )?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }
}
