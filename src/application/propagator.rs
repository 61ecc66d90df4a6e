//! Sync Event Propagator
//!
//! Emits local mutations as sync events and applies events from the user's
//! other devices to the local replica. Per connection the propagator moves
//! through `Disconnected -> Subscribing -> Live -> Disconnected`; a dropped
//! subscription is re-opened with backoff until the propagator is stopped.
//!
//! Incoming events pass the [`EventFilter`] before the per-key lock is taken
//! and the last-writer-wins rule decides whether they are applied. Catch-up
//! reads resume from the highest event log `sequence` processed, so events
//! flushed late from another device's outbox are still picked up.

use crate::domain::entities::{
    ConflictReport, DocumentChange, DocumentChangeKind, SyncEvent, SyncStats,
};
use crate::domain::errors::SyncError;
use crate::domain::ports::{RemoteStore, ReplicaStore};
use crate::domain::services::{resolve_against, EventFilter, FilterVerdict};
use crate::domain::value_objects::{duration_millis, now_millis, DeviceId, Operation, UserId};
use crate::infrastructure::{retry, CancelHandle, RetryConfig, WriteLocks};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const NOTIFICATION_CAPACITY: usize = 1024;

/// Connection state of the live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Subscribing,
    Live,
}

/// Notifications emitted by the propagator.
#[derive(Debug, Clone)]
pub enum SyncNotification {
    StateChanged(ConnectionState),
    /// A remote event was applied to (or rejected by) the local replica
    EventApplied(SyncEvent),
    /// Local and remote timestamps disagreed
    Conflict(ConflictReport),
    /// A local event was queued because the remote store is unreachable
    Queued { pending: usize },
    Error(String),
}

/// Construction parameters for [`SyncPropagator`].
#[derive(Clone)]
pub struct PropagatorSettings {
    pub user: UserId,
    pub device: DeviceId,
    pub max_event_age_ms: u64,
    pub seen_token_capacity: usize,
    pub reconnect: RetryConfig,
}

struct Inner {
    user: UserId,
    device: DeviceId,
    max_event_age_ms: u64,
    reconnect: RetryConfig,
    remote: Arc<dyn RemoteStore>,
    replica: Arc<dyn ReplicaStore>,
    locks: Arc<WriteLocks>,
    filter: Mutex<EventFilter>,
    stats: Mutex<SyncStats>,
    /// Events not yet accepted by the remote store, in emission order.
    /// The async lock also serializes emission.
    outbox: tokio::sync::Mutex<VecDeque<SyncEvent>>,
    /// Events the remote store refused permanently.
    rejected: Mutex<Vec<SyncEvent>>,
    /// Highest event log sequence processed.
    cursor: Mutex<u64>,
    state: watch::Sender<ConnectionState>,
    notify: mpsc::Sender<SyncNotification>,
}

impl Inner {
    fn notify(&self, notification: SyncNotification) {
        // Dropped when nobody is listening or the listener lags.
        let _ = self.notify.try_send(notification);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(user = %self.user, "sync connection {:?} -> {:?}", previous, state);
            self.notify(SyncNotification::StateChanged(state));
        }
    }

    fn touch_last_sync(&self) {
        self.stats.lock().last_sync_time = Some(now_millis());
    }

    /// Publish queued events in order.
    ///
    /// A transient failure leaves the event and everything after it queued.
    /// An event the remote store refuses is moved to the rejected list so the
    /// ones behind it still go out. Returns the number of events published.
    async fn flush_locked(&self, outbox: &mut VecDeque<SyncEvent>) -> Result<usize, SyncError> {
        let mut published = 0;
        while let Some(event) = outbox.front() {
            self.filter.lock().mark_emitted(event.sync_token.clone());
            match self.remote.publish_event(&self.user, event).await {
                Ok(()) => {
                    tracing::debug!(
                        store = %event.store,
                        item_id = %event.item_id,
                        operation = %event.operation,
                        "event published"
                    );
                    outbox.pop_front();
                    published += 1;
                    self.stats.lock().events_sent += 1;
                    self.touch_last_sync();
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(pending = outbox.len(), "remote unreachable, events queued: {}", e);
                    self.notify(SyncNotification::Queued {
                        pending: outbox.len(),
                    });
                    break;
                }
                // Not specific to this event, keep everything queued.
                Err(SyncError::AuthenticationRequired) => {
                    return Err(SyncError::AuthenticationRequired)
                }
                Err(e) => {
                    tracing::warn!(
                        store = %event.store,
                        item_id = %event.item_id,
                        sync_token = %event.sync_token,
                        "event rejected by remote store, skipped: {}",
                        e
                    );
                    self.notify(SyncNotification::Error(e.to_string()));
                    if let Some(event) = outbox.pop_front() {
                        self.rejected.lock().push(event);
                    }
                    self.stats.lock().events_rejected += 1;
                }
            }
        }
        Ok(published)
    }

    async fn flush_outbox(&self) -> Result<usize, SyncError> {
        let mut outbox = self.outbox.lock().await;
        self.flush_locked(&mut outbox).await
    }

    async fn handle_change(&self, change: DocumentChange) -> Result<FilterVerdict, SyncError> {
        match change.kind {
            DocumentChangeKind::Added | DocumentChangeKind::Modified => {
                self.handle_remote_event(change.event).await
            }
            DocumentChangeKind::Removed => {
                // Event log housekeeping, nothing to apply.
                tracing::debug!(event_id = %change.event.id, "sync event removed remotely");
                Ok(FilterVerdict::Duplicate)
            }
        }
    }

    async fn handle_remote_event(&self, event: SyncEvent) -> Result<FilterVerdict, SyncError> {
        let verdict = self.filter.lock().check(&event, now_millis());
        if !verdict.is_accept() {
            if verdict.is_counted_drop() {
                self.stats.lock().events_dropped += 1;
            }
            self.advance_cursor(&event);
            tracing::debug!(
                store = %event.store,
                item_id = %event.item_id,
                "dropped remote event: {:?}",
                verdict
            );
            return Ok(verdict);
        }

        if let Err(e) = self.apply(&event).await {
            self.filter.lock().release(&event.sync_token);
            tracing::error!(store = %event.store, item_id = %event.item_id, "failed to apply remote event: {}", e);
            return Err(e);
        }
        self.advance_cursor(&event);
        Ok(verdict)
    }

    async fn apply(&self, event: &SyncEvent) -> Result<(), SyncError> {
        let _key = self.locks.lock_key(&event.store, &event.item_id).await;

        let local = self.replica.get(&event.store, &event.item_id).await?;
        let local_ts = local.as_ref().map(|r| r.last_modified);
        let resolution = resolve_against(local_ts, event.timestamp);

        if resolution.conflict {
            let report = ConflictReport {
                store: event.store.clone(),
                item_id: event.item_id.clone(),
                local_timestamp: local_ts.unwrap_or_default(),
                remote_timestamp: event.timestamp,
                winner: resolution.winner,
            };
            tracing::info!(
                store = %report.store,
                item_id = %report.item_id,
                local = report.local_timestamp,
                remote = report.remote_timestamp,
                "conflict resolved: {:?} wins",
                report.winner
            );
            self.stats.lock().conflicts += 1;
            self.notify(SyncNotification::Conflict(report));
        }

        if resolution.remote_wins() {
            match event.to_record() {
                Some(record) => self.replica.put(&event.store, record).await?,
                None => {
                    self.replica.delete(&event.store, &event.item_id).await?;
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.events_received += 1;
            stats.last_sync_time = Some(now_millis());
        }
        tracing::debug!(
            store = %event.store,
            item_id = %event.item_id,
            operation = %event.operation,
            applied = resolution.remote_wins(),
            "remote event processed"
        );
        self.notify(SyncNotification::EventApplied(event.clone()));
        Ok(())
    }

    /// Where a (re)subscription or catch-up starts reading the event log.
    fn cursor(&self) -> u64 {
        *self.cursor.lock()
    }

    fn advance_cursor(&self, event: &SyncEvent) {
        if let Some(sequence) = event.sequence {
            let mut cursor = self.cursor.lock();
            *cursor = (*cursor).max(sequence);
        }
    }

    /// Subscription loop, reconnecting until cancelled.
    async fn run(self: Arc<Self>, cancel: CancelHandle) {
        while !cancel.is_cancelled() {
            self.set_state(ConnectionState::Subscribing);

            let after = self.cursor();
            let subscribed = retry("subscribe", &self.reconnect, &cancel, || {
                self.remote.subscribe(&self.user, after)
            })
            .await;

            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(SyncError::Cancelled) => break,
                Err(e) if e.is_retryable() => {
                    self.set_state(ConnectionState::Disconnected);
                    if self.pause(&cancel).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!("subscription failed, giving up: {}", e);
                    self.notify(SyncNotification::Error(e.to_string()));
                    break;
                }
            };

            self.set_state(ConnectionState::Live);
            if let Err(e) = self.flush_outbox().await {
                tracing::warn!("outbox flush failed: {}", e);
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = stream.recv() => match change {
                        Some(change) => {
                            if let Err(e) = self.handle_change(change).await {
                                self.notify(SyncNotification::Error(e.to_string()));
                            }
                        }
                        None => {
                            tracing::warn!("subscription dropped, reconnecting");
                            break;
                        }
                    },
                }
            }

            self.set_state(ConnectionState::Disconnected);
            if self.pause(&cancel).await.is_err() {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Wait before re-subscribing so a flapping connection cannot spin.
    async fn pause(&self, cancel: &CancelHandle) -> Result<(), SyncError> {
        let delay = self.reconnect.initial_delay;
        cancel
            .run(async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await
    }
}

struct Running {
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

/// Real-time propagation of mutations between a user's devices.
pub struct SyncPropagator {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
    notifications: Mutex<Option<mpsc::Receiver<SyncNotification>>>,
}

impl SyncPropagator {
    pub fn new(
        settings: PropagatorSettings,
        remote: Arc<dyn RemoteStore>,
        replica: Arc<dyn ReplicaStore>,
        locks: Arc<WriteLocks>,
    ) -> Self {
        let (notify, rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let filter = EventFilter::with_capacity(
            settings.device.clone(),
            settings.max_event_age_ms,
            settings.seen_token_capacity,
        );

        Self {
            inner: Arc::new(Inner {
                user: settings.user,
                device: settings.device,
                max_event_age_ms: settings.max_event_age_ms,
                reconnect: settings.reconnect,
                remote,
                replica,
                locks,
                filter: Mutex::new(filter),
                stats: Mutex::new(SyncStats::default()),
                outbox: tokio::sync::Mutex::new(VecDeque::new()),
                rejected: Mutex::new(Vec::new()),
                cursor: Mutex::new(0),
                state,
                notify,
            }),
            running: Mutex::new(None),
            notifications: Mutex::new(Some(rx)),
        }
    }

    /// Take the notification receiver (only once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SyncNotification>> {
        self.notifications.lock().take()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |r| !r.task.is_finished())
    }

    /// Start the subscription loop. No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().map_or(false, |r| !r.task.is_finished()) {
            tracing::debug!("propagator already running");
            return;
        }

        let cancel = CancelHandle::new();
        let task = tokio::spawn(self.inner.clone().run(cancel.clone()));
        *running = Some(Running { cancel, task });
        tracing::info!(device_id = %self.inner.device, "propagator started");
    }

    /// Stop the subscription loop and wait for it to exit.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                tracing::error!("propagator task failed: {}", e);
            }
            tracing::info!("propagator stopped");
        }
    }

    /// Apply a local mutation and emit it, stamped with the current time.
    pub async fn record_mutation(
        &self,
        store: &str,
        operation: Operation,
        item_id: &str,
        data: Option<Value>,
    ) -> Result<SyncEvent, SyncError> {
        self.record_mutation_at(store, operation, item_id, data, now_millis())
            .await
    }

    /// Apply a local mutation with an explicit timestamp and emit it.
    ///
    /// Only the local write can fail the call. An unreachable remote store
    /// leaves the event in the outbox.
    pub async fn record_mutation_at(
        &self,
        store: &str,
        operation: Operation,
        item_id: &str,
        data: Option<Value>,
        timestamp: u64,
    ) -> Result<SyncEvent, SyncError> {
        let event = SyncEvent::new(
            self.inner.user.clone(),
            self.inner.device.clone(),
            operation,
            store,
            item_id,
            data,
            timestamp,
        );

        {
            let _key = self.inner.locks.lock_key(store, item_id).await;
            match event.to_record() {
                Some(record) => self.inner.replica.put(store, record).await?,
                None => {
                    self.inner.replica.delete(store, item_id).await?;
                }
            }
        }

        self.emit(event.clone()).await;
        Ok(event)
    }

    /// Queue an event and flush the outbox in emission order.
    async fn emit(&self, event: SyncEvent) {
        let mut outbox = self.inner.outbox.lock().await;
        outbox.push_back(event);
        if let Err(e) = self.inner.flush_locked(&mut outbox).await {
            tracing::warn!(pending = outbox.len(), "events queued, publish failed: {}", e);
        }
    }

    /// Publish queued events now. Returns the number published.
    pub async fn flush(&self) -> Result<usize, SyncError> {
        self.inner.flush_outbox().await
    }

    /// Number of local events not yet accepted by the remote store.
    pub async fn pending(&self) -> usize {
        self.inner.outbox.lock().await.len()
    }

    /// Local events dropped from the outbox after the remote store refused them.
    pub fn rejected_events(&self) -> Vec<SyncEvent> {
        self.inner.rejected.lock().clone()
    }

    /// Feed one remote event through the filter and conflict pipeline.
    pub async fn handle_remote_event(&self, event: SyncEvent) -> Result<FilterVerdict, SyncError> {
        self.inner.handle_remote_event(event).await
    }

    /// Flush the outbox, then pull and apply events missed since the last sync.
    pub async fn sync_now(&self) -> Result<SyncStats, SyncError> {
        let published = self.inner.flush_outbox().await?;
        let pending = self.pending().await;
        if pending > 0 {
            return Err(SyncError::Transport(format!(
                "{} events still queued, remote store unreachable",
                pending
            )));
        }

        let after = self.inner.cursor();
        let events = self.inner.remote.events_since(&self.inner.user, after).await?;
        let mut applied = 0;
        for event in events {
            if self.inner.handle_remote_event(event).await?.is_accept() {
                applied += 1;
            }
        }

        self.inner.touch_last_sync();
        tracing::info!(published, applied, "manual sync finished");
        Ok(self.stats())
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.stats.lock().clone()
    }

    pub fn set_connected_devices(&self, count: usize) {
        self.inner.stats.lock().connected_devices = count;
    }

    /// Zero every counter; the last sync time is kept.
    pub fn reset_stats(&self) {
        let mut stats = self.inner.stats.lock();
        *stats = SyncStats {
            last_sync_time: stats.last_sync_time,
            connected_devices: stats.connected_devices,
            ..SyncStats::default()
        };
    }

    /// Maximum age of remote events accepted, in milliseconds.
    pub fn max_event_age_ms(&self) -> u64 {
        self.inner.max_event_age_ms
    }
}

impl PropagatorSettings {
    pub fn from_config(config: &crate::application::config::SyncConfig, device: DeviceId) -> Self {
        Self {
            user: config.user_id.clone(),
            device,
            max_event_age_ms: duration_millis(config.max_event_age),
            seen_token_capacity: config.seen_token_capacity,
            reconnect: config.reconnect.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryRemoteStore, MemoryReplicaStore};
    use crate::domain::entities::{DeviceInfo, Record};
    use crate::domain::ports::DocumentStream;
    use crate::domain::value_objects::DAY_MS;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Refuses every event for one item, as a server does with a 4xx.
    struct RefusingRemote {
        inner: Arc<MemoryRemoteStore>,
        refused_item: &'static str,
        error: fn() -> SyncError,
    }

    #[async_trait]
    impl RemoteStore for RefusingRemote {
        async fn publish_event(&self, user: &UserId, event: &SyncEvent) -> Result<(), SyncError> {
            if event.item_id == self.refused_item {
                return Err((self.error)());
            }
            self.inner.publish_event(user, event).await
        }

        async fn events_since(&self, user: &UserId, after: u64) -> Result<Vec<SyncEvent>, SyncError> {
            self.inner.events_since(user, after).await
        }

        async fn subscribe(&self, user: &UserId, after: u64) -> Result<DocumentStream, SyncError> {
            self.inner.subscribe(user, after).await
        }

        async fn count(&self, user: &UserId, collection: &str) -> Result<usize, SyncError> {
            self.inner.count(user, collection).await
        }

        async fn fetch_page(
            &self,
            user: &UserId,
            collection: &str,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<Record>, SyncError> {
            self.inner.fetch_page(user, collection, offset, limit).await
        }

        async fn write_batch(
            &self,
            user: &UserId,
            collection: &str,
            records: &[Record],
        ) -> Result<(), SyncError> {
            self.inner.write_batch(user, collection, records).await
        }

        async fn upsert_device(&self, user: &UserId, device: &DeviceInfo) -> Result<(), SyncError> {
            self.inner.upsert_device(user, device).await
        }

        async fn touch_device(
            &self,
            user: &UserId,
            device: &DeviceId,
            last_seen: u64,
        ) -> Result<bool, SyncError> {
            self.inner.touch_device(user, device, last_seen).await
        }

        async fn list_devices(&self, user: &UserId) -> Result<Vec<DeviceInfo>, SyncError> {
            self.inner.list_devices(user).await
        }

        async fn fetch_backup(&self, user: &UserId, backup_id: &str) -> Result<Value, SyncError> {
            self.inner.fetch_backup(user, backup_id).await
        }

        async fn upload_backup(
            &self,
            user: &UserId,
            backup_id: &str,
            backup: &Value,
        ) -> Result<(), SyncError> {
            self.inner.upload_backup(user, backup_id, backup).await
        }
    }

    fn device_over(remote: Arc<dyn RemoteStore>, id: &str) -> Device {
        let replica = Arc::new(MemoryReplicaStore::new());
        let propagator = SyncPropagator::new(
            PropagatorSettings {
                user: UserId::new("u1"),
                device: DeviceId::new(id),
                max_event_age_ms: 7 * DAY_MS,
                seen_token_capacity: 64,
                reconnect: RetryConfig::fast(),
            },
            remote,
            replica.clone(),
            Arc::new(WriteLocks::new()),
        );
        Device {
            propagator,
            replica,
        }
    }

    struct Device {
        propagator: SyncPropagator,
        replica: Arc<MemoryReplicaStore>,
    }

    fn device(remote: &Arc<MemoryRemoteStore>, id: &str) -> Device {
        device_over(remote.clone(), id)
    }

    fn remote_event(device: &str, op: Operation, item: &str, ts: u64) -> SyncEvent {
        SyncEvent::new(
            UserId::new("u1"),
            DeviceId::new(device),
            op,
            "medications",
            item,
            Some(json!({ "from": device, "ts": ts })),
            ts,
        )
    }

    #[tokio::test]
    async fn test_record_mutation_writes_locally_and_publishes() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = device(&remote, "a");

        let event = a
            .propagator
            .record_mutation("medications", Operation::Create, "m1", Some(json!({"dose": 1})))
            .await
            .unwrap();

        let local = a.replica.get("medications", "m1").await.unwrap().unwrap();
        assert_eq!(local.last_modified, event.timestamp);
        assert_eq!(remote.events(&UserId::new("u1")).len(), 1);
        assert_eq!(a.propagator.stats().events_sent, 1);
    }

    #[tokio::test]
    async fn test_offline_mutation_is_queued_and_flushed_in_order() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = device(&remote, "a");
        remote.set_online(false);

        for (i, item) in ["m1", "m2", "m3"].iter().enumerate() {
            a.propagator
                .record_mutation_at("medications", Operation::Create, item, Some(json!(i)), 1_000 + i as u64)
                .await
                .unwrap();
        }
        assert_eq!(a.propagator.pending().await, 3);
        assert_eq!(a.replica.count("medications").await.unwrap(), 3);

        remote.set_online(true);
        a.propagator.inner.flush_outbox().await.unwrap();

        let published: Vec<_> = remote
            .events(&UserId::new("u1"))
            .into_iter()
            .map(|e| e.item_id)
            .collect();
        assert_eq!(published, vec!["m1", "m2", "m3"]);
        assert_eq!(a.propagator.pending().await, 0);
        assert_eq!(a.propagator.stats().events_sent, 3);
    }

    #[tokio::test]
    async fn test_self_emitted_events_never_touch_replica() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = device(&remote, "a");
        let now = now_millis();

        let verdict = a
            .propagator
            .handle_remote_event(remote_event("a", Operation::Create, "m1", now))
            .await
            .unwrap();

        assert_eq!(verdict, FilterVerdict::SelfEmitted);
        assert_eq!(a.replica.write_count(), 0);
        assert_eq!(a.propagator.stats().events_received, 0);
    }

    #[tokio::test]
    async fn test_remote_newer_wins_and_counts_conflict() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let b = device(&remote, "b");
        let base = now_millis();

        b.replica
            .put("medications", Record::new("m1", base + 90, json!({"from": "b"})))
            .await
            .unwrap();
        b.propagator
            .handle_remote_event(remote_event("a", Operation::Create, "m1", base + 100))
            .await
            .unwrap();

        let stored = b.replica.get("medications", "m1").await.unwrap().unwrap();
        assert_eq!(stored.data["from"], "a");
        let stats = b.propagator.stats();
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.events_received, 1);
    }

    #[tokio::test]
    async fn test_local_wins_on_tie() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let b = device(&remote, "b");
        let ts = now_millis();

        b.replica
            .put("medications", Record::new("m1", ts, json!({"from": "b"})))
            .await
            .unwrap();
        b.propagator
            .handle_remote_event(remote_event("a", Operation::Update, "m1", ts))
            .await
            .unwrap();

        let stored = b.replica.get("medications", "m1").await.unwrap().unwrap();
        assert_eq!(stored.data["from"], "b");
        assert_eq!(b.propagator.stats().conflicts, 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let b = device(&remote, "b");
        let event = remote_event("a", Operation::Create, "m1", now_millis());

        b.propagator.handle_remote_event(event.clone()).await.unwrap();
        let after_first = b.replica.get_all("medications").await.unwrap();

        let verdict = b.propagator.handle_remote_event(event).await.unwrap();
        assert_eq!(verdict, FilterVerdict::Duplicate);
        assert_eq!(b.replica.get_all("medications").await.unwrap(), after_first);
        assert_eq!(b.propagator.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_expired_event_dropped_and_counted() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let b = device(&remote, "b");
        let old = now_millis() - 8 * DAY_MS;

        let verdict = b
            .propagator
            .handle_remote_event(remote_event("a", Operation::Create, "m1", old))
            .await
            .unwrap();

        assert_eq!(verdict, FilterVerdict::Expired);
        assert!(b.replica.get("medications", "m1").await.unwrap().is_none());
        assert_eq!(b.propagator.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_remote_delete_removes_record() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let b = device(&remote, "b");
        let base = now_millis();

        b.replica
            .put("medications", Record::new("m1", base, json!({})))
            .await
            .unwrap();
        b.propagator
            .handle_remote_event(remote_event("a", Operation::Delete, "m1", base + 1))
            .await
            .unwrap();

        assert!(b.replica.get("medications", "m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_subscription_propagates_between_devices() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = device(&remote, "a");
        let b = device(&remote, "b");

        let mut b_state = b.propagator.watch_state();
        b.propagator.start();
        tokio::time::timeout(Duration::from_secs(2), b_state.wait_for(|s| *s == ConnectionState::Live))
            .await
            .unwrap()
            .unwrap();

        a.propagator
            .record_mutation("medications", Operation::Create, "m1", Some(json!({"dose": 2})))
            .await
            .unwrap();

        let mut found = None;
        for _ in 0..100 {
            found = b.replica.get("medications", "m1").await.unwrap();
            if found.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(found.unwrap().data, json!({"dose": 2}));

        b.propagator.stop().await;
        assert_eq!(b.propagator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_after_subscription_drop() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let b = device(&remote, "b");
        let mut states = b.propagator.watch_state();
        b.propagator.start();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == ConnectionState::Live))
            .await
            .unwrap()
            .unwrap();

        remote.set_online(false);
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s != ConnectionState::Live))
            .await
            .unwrap()
            .unwrap();

        remote.set_online(true);
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::Live))
            .await
            .unwrap()
            .unwrap();

        b.propagator.stop().await;
    }

    #[tokio::test]
    async fn test_sync_now_pulls_missed_events() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = device(&remote, "a");
        let b = device(&remote, "b");

        a.propagator
            .record_mutation("medications", Operation::Create, "m1", Some(json!(1)))
            .await
            .unwrap();

        let stats = b.propagator.sync_now().await.unwrap();
        assert_eq!(stats.events_received, 1);
        assert!(stats.last_sync_time.is_some());
        assert!(b.replica.get("medications", "m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = device(&remote, "a");
        a.propagator
            .record_mutation("logs", Operation::Create, "l1", Some(json!(1)))
            .await
            .unwrap();

        a.propagator.reset_stats();
        let stats = a.propagator.stats();
        assert_eq!(stats.events_sent, 0);
        assert!(stats.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn test_notifications_report_conflicts() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let b = device(&remote, "b");
        let mut rx = b.propagator.take_event_rx().unwrap();
        assert!(b.propagator.take_event_rx().is_none());
        let base = now_millis();

        b.replica
            .put("medications", Record::new("m1", base + 50, json!({})))
            .await
            .unwrap();
        b.propagator
            .handle_remote_event(remote_event("a", Operation::Update, "m1", base))
            .await
            .unwrap();

        let mut conflict = None;
        while let Ok(notification) = rx.try_recv() {
            if let SyncNotification::Conflict(report) = notification {
                conflict = Some(report);
            }
        }
        let conflict = conflict.unwrap();
        assert_eq!(conflict.winner, crate::domain::entities::Winner::Local);
        assert_eq!(conflict.local_timestamp, base + 50);
    }

    #[tokio::test]
    async fn test_refused_event_does_not_block_later_ones() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let remote = Arc::new(RefusingRemote {
            inner: memory.clone(),
            refused_item: "bad",
            error: || SyncError::Rejected("remote store returned 400 Bad Request".to_string()),
        });
        let a = device_over(remote, "a");

        a.propagator
            .record_mutation("logs", Operation::Create, "bad", Some(json!(0)))
            .await
            .unwrap();
        for item in ["l1", "l2", "l3"] {
            a.propagator
                .record_mutation("logs", Operation::Create, item, Some(json!(1)))
                .await
                .unwrap();
        }

        let published: Vec<_> = memory
            .events(&UserId::new("u1"))
            .into_iter()
            .map(|e| e.item_id)
            .collect();
        assert_eq!(published, vec!["l1", "l2", "l3"]);
        assert_eq!(a.propagator.pending().await, 0);

        let rejected = a.propagator.rejected_events();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].item_id, "bad");
        let stats = a.propagator.sync_now().await.unwrap();
        assert_eq!(stats.events_rejected, 1);
        assert_eq!(stats.events_sent, 3);
        // The local write stands.
        assert!(a.replica.get("logs", "bad").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_auth_failure_keeps_events_queued_without_failing_writes() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let remote = Arc::new(RefusingRemote {
            inner: memory.clone(),
            refused_item: "m1",
            error: || SyncError::AuthenticationRequired,
        });
        let a = device_over(remote, "a");

        a.propagator
            .record_mutation("medications", Operation::Create, "m1", Some(json!(1)))
            .await
            .unwrap();
        a.propagator
            .record_mutation("medications", Operation::Create, "m2", Some(json!(2)))
            .await
            .unwrap();

        assert_eq!(a.propagator.pending().await, 2);
        assert!(a.propagator.rejected_events().is_empty());
        assert!(memory.events(&UserId::new("u1")).is_empty());
        assert!(matches!(
            a.propagator.sync_now().await,
            Err(SyncError::AuthenticationRequired)
        ));
    }

    #[tokio::test]
    async fn test_late_published_offline_event_reaches_synced_device() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = device(&remote, "a");
        let b = device(&remote, "b");

        // Another event moves B's cursor past the time of A's offline write.
        let c = device(&remote, "c");
        remote.set_online(false);
        a.propagator
            .record_mutation("logs", Operation::Create, "l1", Some(json!({"from": "a"})))
            .await
            .unwrap();
        remote.set_online(true);
        c.propagator
            .record_mutation("logs", Operation::Create, "l2", Some(json!({"from": "c"})))
            .await
            .unwrap();
        b.propagator.sync_now().await.unwrap();
        assert!(b.replica.get("logs", "l2").await.unwrap().is_some());

        a.propagator.sync_now().await.unwrap();
        b.propagator.sync_now().await.unwrap();

        let l1 = b.replica.get("logs", "l1").await.unwrap().unwrap();
        assert_eq!(l1.data, json!({"from": "a"}));
    }
}
