//! Backup/Restore Engine
//!
//! Restore runs through `Downloading -> Validating -> Clearing -> Importing ->
//! Complete`, each stage gated on the previous one. Validation happens before
//! anything is cleared, so a malformed backup never touches the replica.
//!
//! A failure while importing does not roll back the collections already
//! cleared; the attempt is recorded in the restore history with the number of
//! records written and a later bulk download reconciles the replica.

use crate::application::device_registry::read_setting;
use crate::application::ProgressSender;
use crate::domain::entities::{
    interpolate_percent, Record, RestoreHistory, RestoreProgress, RestoreResult, RestoreStage,
};
use crate::domain::errors::SyncError;
use crate::domain::ports::{ClearScope, RemoteStore, ReplicaStore, SettingsStore};
use crate::domain::value_objects::{duration_millis, now_millis, UserId};
use crate::infrastructure::{retry, CancelHandle, RetryConfig, WriteLocks};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub const SCHEMA_VERSION: u32 = 1;
pub const REQUIRED_COLLECTIONS: [&str; 3] = ["medications", "logs", "profile"];
pub const OPTIONAL_COLLECTIONS: [&str; 2] = ["insights", "stats"];
pub const RESTORE_HISTORY_KEY: &str = "restore_history";

/// Portable snapshot of the local replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub schema_version: u32,
    pub backup_id: String,
    pub user_id: UserId,
    /// Milliseconds since UNIX epoch
    pub created_at: u64,
    pub data: BTreeMap<String, Vec<Record>>,
    /// CRC32 of the serialized `data`, lowercase hex
    pub checksum: String,
}

impl BackupSnapshot {
    pub fn to_value(&self) -> Result<Value, SyncError> {
        serde_json::to_value(self).map_err(|e| SyncError::Storage(e.into()))
    }
}

/// CRC32 over the canonical JSON encoding of a backup's `data` object.
pub fn checksum_of(data: &Value) -> String {
    let bytes = serde_json::to_vec(data).unwrap_or_default();
    format!("{:08x}", crc32fast::hash(&bytes))
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A backup that passed validation.
#[derive(Debug, Clone)]
struct ParsedBackup {
    backup_id: Option<String>,
    collections: Vec<(String, Vec<Record>)>,
}

impl ParsedBackup {
    fn total_records(&self) -> usize {
        self.collections.iter().map(|(_, records)| records.len()).sum()
    }
}

/// Entries may be stored records (`{id, lastModified, data}`) or bare
/// payload objects carrying an `id`.
fn parse_record(collection: &str, index: usize, entry: &Value) -> Result<Record, String> {
    let object = entry
        .as_object()
        .ok_or_else(|| format!("{}[{}] is not an object", collection, index))?;
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{}[{}] has no string id", collection, index))?;
    let last_modified = object
        .get("lastModified")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let data = match object.get("data") {
        Some(data) => data.clone(),
        None => entry.clone(),
    };
    Ok(Record::new(id, last_modified, data))
}

fn parse_collection(name: &str, value: &Value) -> Result<Vec<Record>, String> {
    let entries = value
        .as_array()
        .ok_or_else(|| format!("collection '{}' is not a sequence", name))?;
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| parse_record(name, i, entry))
        .collect()
}

fn parse(backup: &Value) -> Result<ParsedBackup, String> {
    let root = backup
        .as_object()
        .ok_or_else(|| "backup must be an object".to_string())?;

    if let Some(version) = root.get("schemaVersion") {
        if version.as_u64() != Some(u64::from(SCHEMA_VERSION)) {
            return Err(format!("unsupported schema version {}", version));
        }
    }

    let data: &Map<String, Value> = root
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| "backup has no data object".to_string())?;

    if let Some(checksum) = root.get("checksum") {
        let expected = checksum
            .as_str()
            .ok_or_else(|| "checksum is not a string".to_string())?;
        let actual = checksum_of(&root["data"]);
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(format!("checksum mismatch: expected {}, computed {}", expected, actual));
        }
    }

    let mut collections = Vec::new();
    for name in REQUIRED_COLLECTIONS {
        let value = data
            .get(name)
            .ok_or_else(|| format!("missing required collection '{}'", name))?;
        collections.push((name.to_string(), parse_collection(name, value)?));
    }
    for name in OPTIONAL_COLLECTIONS {
        if let Some(value) = data.get(name) {
            collections.push((name.to_string(), parse_collection(name, value)?));
        }
    }

    Ok(ParsedBackup {
        backup_id: root
            .get("backupId")
            .and_then(Value::as_str)
            .map(str::to_string),
        collections,
    })
}

/// Check a backup without touching any store.
pub fn validate(backup: &Value) -> ValidationReport {
    match parse(backup) {
        Ok(_) => ValidationReport {
            valid: true,
            error: None,
        },
        Err(error) => ValidationReport {
            valid: false,
            error: Some(error),
        },
    }
}

/// Where a restore reads its backup from.
#[derive(Debug, Clone)]
pub enum BackupSource {
    /// Backup document already in memory
    Inline(Value),
    /// Backup stored in the remote store under this id
    Remote(String),
}

/// Reporter enforcing a non-decreasing percent.
struct Reporter<'a> {
    sink: Option<&'a ProgressSender<RestoreProgress>>,
    percent: u8,
}

impl Reporter<'_> {
    fn emit(
        &mut self,
        stage: RestoreStage,
        percent: u8,
        processed: usize,
        total: usize,
        current_store: Option<&str>,
    ) {
        let percent = match stage {
            RestoreStage::Complete => 100,
            _ => percent.min(99),
        };
        self.percent = self.percent.max(percent);
        if let Some(sink) = self.sink {
            let _ = sink.send(RestoreProgress {
                stage,
                percent: self.percent,
                items_processed: processed,
                total_items: total,
                current_store: current_store.map(str::to_string),
            });
        }
    }
}

/// Clears the running flag when a restore ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Snapshot export and staged restore of the local replica.
pub struct BackupEngine {
    user: UserId,
    remote: Arc<dyn RemoteStore>,
    replica: Arc<dyn ReplicaStore>,
    settings: Arc<dyn SettingsStore>,
    locks: Arc<WriteLocks>,
    batch_size: usize,
    retry: RetryConfig,
    running: AtomicBool,
}

impl BackupEngine {
    pub fn new(
        user: UserId,
        remote: Arc<dyn RemoteStore>,
        replica: Arc<dyn ReplicaStore>,
        settings: Arc<dyn SettingsStore>,
        locks: Arc<WriteLocks>,
        batch_size: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            user,
            remote,
            replica,
            settings,
            locks,
            batch_size: batch_size.max(1),
            retry,
            running: AtomicBool::new(false),
        }
    }

    /// Restore history, newest first. Unreadable history is treated as empty.
    pub fn history(&self) -> RestoreHistory {
        let Some(raw) = read_setting(self.settings.as_ref(), RESTORE_HISTORY_KEY) else {
            return RestoreHistory::new();
        };
        match serde_json::from_str(&raw) {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!("discarding corrupted restore history: {}", e);
                RestoreHistory::new()
            }
        }
    }

    fn append_history(&self, result: &RestoreResult) {
        let mut history = self.history();
        history.record(result.clone());
        let persisted = serde_json::to_string(&history)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                self.settings
                    .set(RESTORE_HISTORY_KEY, &json)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = persisted {
            tracing::error!("failed to persist restore history: {}", e);
        }
    }

    /// Snapshot every backed-up collection of the local replica.
    pub async fn export(&self) -> Result<BackupSnapshot, SyncError> {
        let mut data = BTreeMap::new();
        for name in REQUIRED_COLLECTIONS.iter().chain(OPTIONAL_COLLECTIONS.iter()) {
            data.insert(name.to_string(), self.replica.get_all(name).await?);
        }

        let data_value = serde_json::to_value(&data).map_err(|e| SyncError::Storage(e.into()))?;
        let snapshot = BackupSnapshot {
            schema_version: SCHEMA_VERSION,
            backup_id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user.clone(),
            created_at: now_millis(),
            checksum: checksum_of(&data_value),
            data,
        };
        tracing::info!(backup_id = %snapshot.backup_id, "backup exported");
        Ok(snapshot)
    }

    /// Store a snapshot in the remote store.
    pub async fn upload(&self, snapshot: &BackupSnapshot) -> Result<(), SyncError> {
        let value = snapshot.to_value()?;
        self.remote
            .upload_backup(&self.user, &snapshot.backup_id, &value)
            .await?;
        tracing::info!(backup_id = %snapshot.backup_id, "backup uploaded");
        Ok(())
    }

    /// Restore the replica from a backup.
    ///
    /// Every attempt, successful or not, is appended to the restore history.
    pub async fn restore(
        &self,
        source: BackupSource,
        cancel: &CancelHandle,
        progress: Option<&ProgressSender<RestoreProgress>>,
    ) -> Result<RestoreResult, SyncError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning("restore"));
        }
        let _running = RunGuard(&self.running);

        let started = Instant::now();
        let mut reporter = Reporter {
            sink: progress,
            percent: 0,
        };
        let mut backup_id = match &source {
            BackupSource::Remote(id) => id.clone(),
            BackupSource::Inline(_) => String::new(),
        };
        let mut restored = 0;

        let outcome = self
            .run_stages(source, cancel, &mut reporter, &mut backup_id, &mut restored)
            .await;

        let result = RestoreResult {
            success: outcome.is_ok(),
            backup_id: backup_id.clone(),
            items_restored: restored,
            duration: duration_millis(started.elapsed()),
            error: outcome.as_ref().err().map(|e| e.to_string()),
            finished_at: now_millis(),
        };
        self.append_history(&result);

        match outcome {
            Ok(()) => {
                reporter.emit(RestoreStage::Complete, 100, restored, restored, None);
                tracing::info!(backup_id = %backup_id, items = restored, "restore complete");
                Ok(result)
            }
            Err(e) => {
                let percent = reporter.percent;
                reporter.emit(RestoreStage::Failed, percent, restored, restored, None);
                tracing::error!(backup_id = %backup_id, items = restored, "restore failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        source: BackupSource,
        cancel: &CancelHandle,
        reporter: &mut Reporter<'_>,
        backup_id: &mut String,
        restored: &mut usize,
    ) -> Result<(), SyncError> {
        // Downloading
        reporter.emit(RestoreStage::Downloading, 0, 0, 0, None);
        let document = match source {
            BackupSource::Inline(value) => value,
            BackupSource::Remote(id) => {
                tracing::info!(backup_id = %id, "downloading backup");
                retry("fetch backup", &self.retry, cancel, || {
                    self.remote.fetch_backup(&self.user, &id)
                })
                .await?
            }
        };
        cancel.check()?;

        // Validating
        reporter.emit(RestoreStage::Validating, 10, 0, 0, None);
        let parsed = parse(&document).map_err(|e| {
            tracing::warn!("backup rejected: {}", e);
            SyncError::ValidationFailed(e)
        })?;
        if let Some(id) = &parsed.backup_id {
            *backup_id = id.clone();
        } else if backup_id.is_empty() {
            *backup_id = "inline".to_string();
        }
        let total = parsed.total_records();
        cancel.check()?;

        // Clearing: hold every target collection until the import finishes.
        reporter.emit(RestoreStage::Clearing, 20, 0, total, None);
        let mut names: Vec<&str> = parsed.collections.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        let mut guards = Vec::with_capacity(names.len());
        for name in &names {
            guards.push(self.locks.lock_collection(name).await);
        }

        let range = RestoreStage::Clearing.percent_range();
        for (i, (name, _)) in parsed.collections.iter().enumerate() {
            cancel.check()?;
            self.replica.clear(ClearScope::Collection(name.clone())).await?;
            reporter.emit(
                RestoreStage::Clearing,
                interpolate_percent(range, i + 1, parsed.collections.len()),
                0,
                total,
                Some(name.as_str()),
            );
            tracing::debug!(collection = %name, "collection cleared");
        }

        // Importing
        let range = RestoreStage::Importing.percent_range();
        reporter.emit(RestoreStage::Importing, range.0, 0, total, None);
        for (name, records) in parsed.collections {
            for batch in records.chunks(self.batch_size) {
                cancel.check()?;
                self.replica.put_batch(&name, batch.to_vec()).await?;
                *restored += batch.len();
                reporter.emit(
                    RestoreStage::Importing,
                    interpolate_percent(range, *restored, total),
                    *restored,
                    total,
                    Some(name.as_str()),
                );
            }
        }

        drop(guards);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryRemoteStore, MemoryReplicaStore, MemorySettingsStore};
    use crate::domain::entities::Record;
    use crate::domain::errors::StorageError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Cancels the run once `after_batches` batches have been committed.
    struct CancellingReplica {
        inner: MemoryReplicaStore,
        cancel: CancelHandle,
        after_batches: usize,
        batches: AtomicUsize,
    }

    #[async_trait]
    impl ReplicaStore for CancellingReplica {
        async fn put(&self, store: &str, record: Record) -> Result<(), StorageError> {
            self.inner.put(store, record).await
        }

        async fn get(&self, store: &str, id: &str) -> Result<Option<Record>, StorageError> {
            self.inner.get(store, id).await
        }

        async fn put_batch(&self, store: &str, records: Vec<Record>) -> Result<(), StorageError> {
            self.inner.put_batch(store, records).await?;
            if self.batches.fetch_add(1, Ordering::SeqCst) + 1 == self.after_batches {
                self.cancel.cancel();
            }
            Ok(())
        }

        async fn get_all(&self, store: &str) -> Result<Vec<Record>, StorageError> {
            self.inner.get_all(store).await
        }

        async fn delete(&self, store: &str, id: &str) -> Result<bool, StorageError> {
            self.inner.delete(store, id).await
        }

        async fn clear(&self, scope: ClearScope) -> Result<(), StorageError> {
            self.inner.clear(scope).await
        }

        async fn count(&self, store: &str) -> Result<usize, StorageError> {
            self.inner.count(store).await
        }

        async fn collections(&self) -> Result<Vec<String>, StorageError> {
            self.inner.collections().await
        }
    }

    struct Fixture {
        remote: Arc<MemoryRemoteStore>,
        replica: Arc<MemoryReplicaStore>,
        settings: Arc<MemorySettingsStore>,
        engine: BackupEngine,
    }

    fn fixture_with(replica: MemoryReplicaStore) -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let replica = Arc::new(replica);
        let settings = Arc::new(MemorySettingsStore::new());
        let engine = BackupEngine::new(
            UserId::new("u1"),
            remote.clone(),
            replica.clone(),
            settings.clone(),
            Arc::new(WriteLocks::new()),
            2,
            RetryConfig::fast(),
        );
        Fixture {
            remote,
            replica,
            settings,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryReplicaStore::new())
    }

    fn backup(medications: usize) -> Value {
        let meds: Vec<Value> = (0..medications)
            .map(|i| json!({ "id": format!("m{}", i), "lastModified": i, "data": { "name": i } }))
            .collect();
        json!({
            "backupId": "b-1",
            "data": {
                "medications": meds,
                "logs": [{ "id": "l1", "takenAt": 5 }],
                "profile": []
            }
        })
    }

    #[test]
    fn test_validate_accepts_minimal_backup() {
        assert_eq!(
            validate(&backup(1)),
            ValidationReport {
                valid: true,
                error: None
            }
        );
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let cases = vec![
            (json!([]), "must be an object"),
            (json!({ "data": { "medications": [], "logs": [] } }), "missing required collection 'profile'"),
            (json!({ "data": { "medications": {}, "logs": [], "profile": [] } }), "not a sequence"),
            (json!({ "data": { "medications": [], "logs": [], "profile": [], "stats": 3 } }), "not a sequence"),
            (json!({ "data": { "medications": [{ "name": "x" }], "logs": [], "profile": [] } }), "no string id"),
            (json!({ "schemaVersion": 2, "data": {} }), "schema version"),
            (
                json!({ "checksum": "00000000", "data": { "medications": [], "logs": [], "profile": [] } }),
                "checksum mismatch",
            ),
        ];

        for (input, expected) in cases {
            let report = validate(&input);
            assert!(!report.valid, "accepted {}", input);
            let error = report.error.unwrap();
            assert!(error.contains(expected), "{} did not contain {}", error, expected);
        }
    }

    #[test]
    fn test_bare_payload_entries_keep_whole_object() {
        let parsed = parse(&backup(0)).unwrap();
        let (_, logs) = &parsed.collections[1];
        assert_eq!(logs[0].data, json!({ "id": "l1", "takenAt": 5 }));
        assert_eq!(logs[0].last_modified, 0);
    }

    #[tokio::test]
    async fn test_invalid_backup_never_clears() {
        let f = fixture();
        f.replica
            .put("medications", Record::new("keep", 1, json!({})))
            .await
            .unwrap();
        let writes_before = f.replica.write_count();

        let result = f
            .engine
            .restore(
                BackupSource::Inline(json!({ "data": { "medications": [] } })),
                &CancelHandle::new(),
                None,
            )
            .await;

        assert!(matches!(result, Err(SyncError::ValidationFailed(_))));
        assert_eq!(f.replica.write_count(), writes_before);
        assert!(f.replica.get("medications", "keep").await.unwrap().is_some());

        let latest = f.engine.history().latest().cloned().unwrap();
        assert!(!latest.success);
        assert_eq!(latest.items_restored, 0);
    }

    #[tokio::test]
    async fn test_restore_replaces_collections() {
        let f = fixture();
        f.replica
            .put("medications", Record::new("stale", 1, json!({})))
            .await
            .unwrap();
        f.replica
            .put("insights", Record::new("untouched", 1, json!({})))
            .await
            .unwrap();

        let result = f
            .engine
            .restore(BackupSource::Inline(backup(3)), &CancelHandle::new(), None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.backup_id, "b-1");
        assert_eq!(result.items_restored, 4);
        assert!(f.replica.get("medications", "stale").await.unwrap().is_none());
        assert_eq!(f.replica.count("medications").await.unwrap(), 3);
        assert_eq!(f.replica.count("insights").await.unwrap(), 1);
        assert_eq!(f.engine.history().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_progress_monotonic() {
        let f = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();

        f.engine
            .restore(BackupSource::Inline(backup(7)), &CancelHandle::new(), Some(&tx))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        for pair in events.windows(2) {
            assert!(pair[1].percent >= pair[0].percent, "{:?}", pair);
        }
        let last = events.last().unwrap();
        assert_eq!(last.stage, RestoreStage::Complete);
        assert_eq!(last.percent, 100);
        assert!(events
            .iter()
            .any(|e| e.stage == RestoreStage::Importing && e.current_store.as_deref() == Some("medications")));
    }

    #[tokio::test]
    async fn test_failed_import_records_partial_count() {
        // Room for the first two batches only.
        let f = fixture_with(MemoryReplicaStore::with_capacity_limit(4));

        let result = f
            .engine
            .restore(BackupSource::Inline(backup(5)), &CancelHandle::new(), None)
            .await;

        assert!(matches!(result, Err(SyncError::StorageExhausted(_))));
        let latest = f.engine.history().latest().cloned().unwrap();
        assert!(!latest.success);
        assert_eq!(latest.items_restored, 4);
        assert!(latest.error.is_some());
    }

    #[tokio::test]
    async fn test_restore_from_remote_backup() {
        let f = fixture();
        f.remote
            .upload_backup(&UserId::new("u1"), "remote-1", &backup(2))
            .await
            .unwrap();

        let result = f
            .engine
            .restore(BackupSource::Remote("remote-1".to_string()), &CancelHandle::new(), None)
            .await
            .unwrap();
        assert_eq!(result.items_restored, 3);
    }

    #[tokio::test]
    async fn test_export_roundtrips_through_validation() {
        let f = fixture();
        f.replica
            .put("medications", Record::new("m1", 10, json!({ "name": "A" })))
            .await
            .unwrap();

        let snapshot = f.engine.export().await.unwrap();
        assert_eq!(snapshot.schema_version, SCHEMA_VERSION);
        assert_eq!(snapshot.data["medications"].len(), 1);

        let value = snapshot.to_value().unwrap();
        assert!(validate(&value).valid);

        f.engine.upload(&snapshot).await.unwrap();
        assert!(f
            .remote
            .fetch_backup(&UserId::new("u1"), &snapshot.backup_id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_tampered_export_fails_checksum() {
        let f = fixture();
        f.replica
            .put("logs", Record::new("l1", 1, json!({ "dose": 1 })))
            .await
            .unwrap();

        let mut value = f.engine.export().await.unwrap().to_value().unwrap();
        value["data"]["logs"][0]["data"]["dose"] = json!(2);

        let report = validate(&value);
        assert!(!report.valid);
        assert!(report.error.unwrap().contains("checksum"));
    }

    #[tokio::test]
    async fn test_corrupted_history_is_treated_as_empty() {
        let f = fixture();
        f.settings.set(RESTORE_HISTORY_KEY, "{not json").unwrap();
        assert!(f.engine.history().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_import_batches_records_partial_restore() {
        let cancel = CancelHandle::new();
        let replica = Arc::new(CancellingReplica {
            inner: MemoryReplicaStore::new(),
            cancel: cancel.clone(),
            after_batches: 2,
            batches: AtomicUsize::new(0),
        });
        replica
            .put("logs", Record::new("old-log", 1, json!({})))
            .await
            .unwrap();
        let engine = BackupEngine::new(
            UserId::new("u1"),
            Arc::new(MemoryRemoteStore::new()),
            replica.clone(),
            Arc::new(MemorySettingsStore::new()),
            Arc::new(WriteLocks::new()),
            2,
            RetryConfig::fast(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = engine
            .restore(BackupSource::Inline(backup(5)), &cancel, Some(&tx))
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        let latest = engine.history().latest().cloned().unwrap();
        assert!(!latest.success);
        assert_eq!(latest.backup_id, "b-1");
        assert_eq!(latest.items_restored, 4);
        assert_eq!(latest.error.as_deref(), Some("operation cancelled"));

        // Committed batches stay; the cleared collections are not rolled back.
        assert_eq!(replica.count("medications").await.unwrap(), 4);
        assert_eq!(replica.count("logs").await.unwrap(), 0);

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.stage, RestoreStage::Failed);
        assert!(last.percent < 100);
    }
}
