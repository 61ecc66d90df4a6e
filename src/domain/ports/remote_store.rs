//! Remote Store Port
//!
//! Defines the interface to the authoritative, namespaced document store,
//! organized as `users/{userId}/{collection}/{documentId}`. The engine assumes
//! ordered-enough, at-least-once delivery and nothing more.
//!
//! The event log is read by receive position, never by event timestamp: an
//! event published late from an outbox keeps its original timestamp but gets
//! a fresh `sequence`.

use crate::domain::entities::{DeviceInfo, DocumentChange, Record, SyncEvent};
use crate::domain::errors::SyncError;
use crate::domain::value_objects::{DeviceId, UserId};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Live stream of changes to a user's event collection.
///
/// The channel closing means the subscription dropped and must be re-opened.
pub type DocumentStream = mpsc::Receiver<DocumentChange>;

/// Client to the remote authoritative store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Append an event to the user's event log.
    ///
    /// The store stamps the stored copy with the next `sequence`.
    async fn publish_event(&self, user: &UserId, event: &SyncEvent) -> Result<(), SyncError>;

    /// Events with `sequence > after`, in receive order.
    async fn events_since(&self, user: &UserId, after: u64) -> Result<Vec<SyncEvent>, SyncError>;

    /// Subscribe to event changes, replaying those with `sequence > after` first.
    async fn subscribe(&self, user: &UserId, after: u64) -> Result<DocumentStream, SyncError>;

    /// Number of documents in a collection.
    async fn count(&self, user: &UserId, collection: &str) -> Result<usize, SyncError>;

    /// One page of a collection, ordered by id.
    async fn fetch_page(
        &self,
        user: &UserId,
        collection: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Record>, SyncError>;

    /// Write a batch of documents to a collection.
    async fn write_batch(
        &self,
        user: &UserId,
        collection: &str,
        records: &[Record],
    ) -> Result<(), SyncError>;

    /// Create or replace a device entry.
    async fn upsert_device(&self, user: &UserId, device: &DeviceInfo) -> Result<(), SyncError>;

    /// Update a device's last-seen time. Returns false if the device is unknown.
    async fn touch_device(
        &self,
        user: &UserId,
        device: &DeviceId,
        last_seen: u64,
    ) -> Result<bool, SyncError>;

    /// Every device registered for the user, stale ones included.
    async fn list_devices(&self, user: &UserId) -> Result<Vec<DeviceInfo>, SyncError>;

    /// Download a stored backup document.
    async fn fetch_backup(&self, user: &UserId, backup_id: &str) -> Result<Value, SyncError>;

    /// Store a backup document under `backup_id`.
    async fn upload_backup(
        &self,
        user: &UserId,
        backup_id: &str,
        backup: &Value,
    ) -> Result<(), SyncError>;
}
