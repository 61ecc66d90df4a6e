//! Domain Entities - Core objects of the sync engine
//!
//! These entities flow between the local replica, the remote store and the
//! callers of the engine. Record payloads are opaque JSON: the engine only
//! reads the `last_modified` timestamp used for conflict resolution.

use crate::domain::value_objects::{DeviceId, Operation, Platform, SyncToken, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Maximum number of entries kept in the restore history.
pub const RESTORE_HISTORY_LIMIT: usize = 20;

/// One record of the local replica, keyed by `(collection, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Item identifier, unique within its collection
    pub id: String,
    /// Last-write timestamp in milliseconds since UNIX epoch
    pub last_modified: u64,
    /// Opaque payload
    pub data: Value,
}

impl Record {
    pub fn new(id: impl Into<String>, last_modified: u64, data: Value) -> Self {
        Self {
            id: id.into(),
            last_modified,
            data,
        }
    }
}

/// A single mutation of one record in one collection.
///
/// Immutable once emitted; `sync_token` is unique per emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub id: String,
    pub user_id: UserId,
    pub device_id: DeviceId,
    /// Emission time in milliseconds since UNIX epoch
    pub timestamp: u64,
    pub operation: Operation,
    /// Collection name
    pub store: String,
    pub item_id: String,
    /// Present for create/update, absent for delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub sync_token: SyncToken,
    /// Position in the remote event log, assigned by the store on receipt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl SyncEvent {
    /// Build a new event with a fresh id and sync token.
    ///
    /// The payload is discarded for deletes.
    pub fn new(
        user_id: UserId,
        device_id: DeviceId,
        operation: Operation,
        store: impl Into<String>,
        item_id: impl Into<String>,
        data: Option<Value>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            device_id,
            timestamp,
            operation,
            store: store.into(),
            item_id: item_id.into(),
            data: if operation.carries_data() { data } else { None },
            sync_token: SyncToken::generate(),
            sequence: None,
        }
    }

    /// Record this event writes into the replica, if any.
    pub fn to_record(&self) -> Option<Record> {
        if !self.operation.carries_data() {
            return None;
        }
        Some(Record::new(
            self.item_id.clone(),
            self.timestamp,
            self.data.clone().unwrap_or(Value::Null),
        ))
    }

    /// Age of the event relative to `now_ms` (zero for future timestamps).
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp)
    }
}

/// Kind of change delivered by a remote subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

/// A change to a sync event document in the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub kind: DocumentChangeKind,
    pub event: SyncEvent,
}

impl DocumentChange {
    pub fn added(event: SyncEvent) -> Self {
        Self {
            kind: DocumentChangeKind::Added,
            event,
        }
    }
}

/// A device associated with a user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub user_id: UserId,
    pub name: String,
    /// Last heartbeat in milliseconds since UNIX epoch
    pub last_seen: u64,
    pub platform: Platform,
    /// Derived locally, never transmitted
    #[serde(skip)]
    pub is_current_device: bool,
}

impl DeviceInfo {
    /// Whether the last heartbeat is older than `horizon_ms` at `now_ms`.
    pub fn is_stale(&self, now_ms: u64, horizon_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen) > horizon_ms
    }
}

/// Accumulating sync counters, reset only explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub events_received: u64,
    pub events_sent: u64,
    pub conflicts: u64,
    /// Events filtered out by the age or duplicate filters
    pub events_dropped: u64,
    /// Local events the remote store refused permanently
    #[serde(default)]
    pub events_rejected: u64,
    pub last_sync_time: Option<u64>,
    pub connected_devices: usize,
}

/// Which side a conflict resolution picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
}

/// A record whose local and remote timestamps disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub store: String,
    pub item_id: String,
    pub local_timestamp: u64,
    pub remote_timestamp: u64,
    pub winner: Winner,
}

/// Map `done / total` onto `range`, never exceeding its upper bound.
pub fn interpolate_percent(range: (u8, u8), done: usize, total: usize) -> u8 {
    let (start, end) = range;
    if total == 0 || done >= total {
        return end;
    }
    let span = f64::from(end.saturating_sub(start));
    start + (span * done as f64 / total as f64).floor() as u8
}

/// Stages of a bulk download, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkStage {
    Medications,
    Logs,
    Insights,
    Stats,
    Complete,
}

impl BulkStage {
    /// Download stages, excluding the terminal one.
    pub const DOWNLOAD_ORDER: [BulkStage; 4] =
        [Self::Medications, Self::Logs, Self::Insights, Self::Stats];

    /// Collection fetched during this stage.
    pub fn collection(&self) -> Option<&'static str> {
        match self {
            Self::Medications => Some("medications"),
            Self::Logs => Some("logs"),
            Self::Insights => Some("insights"),
            Self::Stats => Some("stats"),
            Self::Complete => None,
        }
    }

    /// Sub-range of the 0-100 scale assigned to this stage.
    pub fn percent_range(&self) -> (u8, u8) {
        match self {
            Self::Medications => (0, 40),
            Self::Logs => (40, 70),
            Self::Insights => (70, 90),
            Self::Stats => (90, 100),
            Self::Complete => (100, 100),
        }
    }
}

impl std::fmt::Display for BulkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.collection() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "complete"),
        }
    }
}

/// Progress of a bulk download run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub stage: BulkStage,
    pub percent: u8,
    pub items_downloaded: usize,
    pub total_items: usize,
    pub current_store: Option<String>,
}

/// Stages of a restore run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStage {
    Downloading,
    Validating,
    Clearing,
    Importing,
    Complete,
    Failed,
}

impl RestoreStage {
    pub fn percent_range(&self) -> (u8, u8) {
        match self {
            Self::Downloading => (0, 10),
            Self::Validating => (10, 20),
            Self::Clearing => (20, 50),
            Self::Importing => (50, 95),
            Self::Complete => (100, 100),
            Self::Failed => (0, 0),
        }
    }
}

/// Progress of a restore run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreProgress {
    pub stage: RestoreStage,
    pub percent: u8,
    pub items_processed: usize,
    pub total_items: usize,
    pub current_store: Option<String>,
}

/// Point-in-time view of local storage consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
    /// `usage / quota * 100` rounded; 0 when quota is unknown (0)
    pub usage_percent: u32,
    pub available: u64,
}

impl StorageEstimate {
    pub fn from_usage(usage: u64, quota: u64) -> Self {
        let usage_percent = if quota == 0 {
            0
        } else {
            (usage as f64 / quota as f64 * 100.0).round() as u32
        };
        Self {
            usage,
            quota,
            usage_percent,
            available: quota.saturating_sub(usage),
        }
    }
}

/// Outcome of one restore attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub success: bool,
    pub backup_id: String,
    pub items_restored: usize,
    /// Wall time of the attempt in milliseconds
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion time in milliseconds since UNIX epoch
    #[serde(default)]
    pub finished_at: u64,
}

/// Newest-first log of restore outcomes, capped at [`RESTORE_HISTORY_LIMIT`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestoreHistory {
    entries: VecDeque<RestoreResult>,
}

impl RestoreHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend an outcome, dropping the oldest beyond the cap.
    pub fn record(&mut self, result: RestoreResult) {
        self.entries.push_front(result);
        self.entries.truncate(RESTORE_HISTORY_LIMIT);
    }

    pub fn entries(&self) -> Vec<RestoreResult> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&RestoreResult> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(op: Operation, data: Option<Value>) -> SyncEvent {
        SyncEvent::new(
            UserId::new("user-1"),
            DeviceId::new("device-a"),
            op,
            "medications",
            "m1",
            data,
            100,
        )
    }

    #[test]
    fn test_sync_event_new_assigns_unique_tokens() {
        let e1 = event(Operation::Create, Some(json!({"name": "A"})));
        let e2 = event(Operation::Create, Some(json!({"name": "A"})));
        assert_ne!(e1.sync_token, e2.sync_token);
        assert_ne!(e1.id, e2.id);
    }

    #[test]
    fn test_sync_event_delete_drops_payload() {
        let e = event(Operation::Delete, Some(json!({"name": "A"})));
        assert!(e.data.is_none());
        assert!(e.to_record().is_none());
    }

    #[test]
    fn test_sync_event_to_record() {
        let e = event(Operation::Update, Some(json!({"dose": 2})));
        let record = e.to_record().unwrap();
        assert_eq!(record.id, "m1");
        assert_eq!(record.last_modified, 100);
        assert_eq!(record.data, json!({"dose": 2}));
    }

    #[test]
    fn test_sync_event_wire_format() {
        let e = event(Operation::Delete, None);
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["operation"], "delete");
        assert_eq!(value["itemId"], "m1");
        assert_eq!(value["deviceId"], "device-a");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_sync_event_age() {
        let e = event(Operation::Create, None);
        assert_eq!(e.age_ms(150), 50);
        assert_eq!(e.age_ms(50), 0);
    }

    #[test]
    fn test_device_info_current_flag_not_transmitted() {
        let device = DeviceInfo {
            id: DeviceId::new("d1"),
            user_id: UserId::new("u1"),
            name: "Linux Device".to_string(),
            last_seen: 10,
            platform: Platform::Linux,
            is_current_device: true,
        };

        let value = serde_json::to_value(&device).unwrap();
        assert!(value.get("isCurrentDevice").is_none());

        let decoded: DeviceInfo = serde_json::from_value(value).unwrap();
        assert!(!decoded.is_current_device);
    }

    #[test]
    fn test_device_is_stale() {
        let device = DeviceInfo {
            id: DeviceId::new("d1"),
            user_id: UserId::new("u1"),
            name: "x".to_string(),
            last_seen: 1_000,
            platform: Platform::Web,
            is_current_device: false,
        };
        assert!(!device.is_stale(1_500, 500));
        assert!(device.is_stale(1_501, 500));
    }

    #[test]
    fn test_storage_estimate_half_used() {
        let estimate = StorageEstimate::from_usage(50, 100);
        assert_eq!(estimate.usage_percent, 50);
        assert_eq!(estimate.available, 50);
    }

    #[test]
    fn test_storage_estimate_zero_quota() {
        let estimate = StorageEstimate::from_usage(12_345, 0);
        assert_eq!(estimate.usage_percent, 0);
        assert_eq!(estimate.available, 0);
    }

    #[test]
    fn test_storage_estimate_rounds_to_nearest() {
        assert_eq!(StorageEstimate::from_usage(2, 3).usage_percent, 67);
        assert_eq!(StorageEstimate::from_usage(1, 3).usage_percent, 33);
        assert_eq!(StorageEstimate::from_usage(1, 200).usage_percent, 1);
    }

    #[test]
    fn test_interpolate_percent() {
        assert_eq!(interpolate_percent((0, 40), 0, 10), 0);
        assert_eq!(interpolate_percent((0, 40), 5, 10), 20);
        assert_eq!(interpolate_percent((0, 40), 10, 10), 40);
        assert_eq!(interpolate_percent((50, 95), 1, 3), 65);
        assert_eq!(interpolate_percent((40, 70), 0, 0), 70);
    }

    #[test]
    fn test_bulk_stage_ranges_are_contiguous() {
        let mut previous_end = 0;
        for stage in BulkStage::DOWNLOAD_ORDER {
            let (start, end) = stage.percent_range();
            assert_eq!(start, previous_end);
            assert!(end > start);
            previous_end = end;
        }
        assert_eq!(previous_end, 100);
    }

    #[test]
    fn test_bulk_stage_display() {
        assert_eq!(BulkStage::Logs.to_string(), "logs");
        assert_eq!(BulkStage::Complete.to_string(), "complete");
    }

    fn result(n: usize) -> RestoreResult {
        RestoreResult {
            success: true,
            backup_id: format!("backup-{}", n),
            items_restored: n,
            duration: 1,
            error: None,
            finished_at: n as u64,
        }
    }

    #[test]
    fn test_restore_history_newest_first_and_capped() {
        let mut history = RestoreHistory::new();
        for n in 0..25 {
            history.record(result(n));
        }

        assert_eq!(history.len(), RESTORE_HISTORY_LIMIT);
        let entries = history.entries();
        assert_eq!(entries[0].backup_id, "backup-24");
        assert_eq!(entries[19].backup_id, "backup-5");
        assert_eq!(history.latest().unwrap().items_restored, 24);
    }

    #[test]
    fn test_restore_history_serializes_as_array() {
        let mut history = RestoreHistory::new();
        history.record(result(1));

        let value = serde_json::to_value(&history).unwrap();
        assert!(value.is_array());

        let decoded: RestoreHistory = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, history);
    }
}
