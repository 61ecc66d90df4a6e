//! In-Memory Remote Store
//!
//! An in-process stand-in for the authoritative document store. Each user
//! namespace keeps an event log in receive order, materialized collections, a device
//! registry and stored backups. Published events fan out to subscribers over
//! a `tokio::sync::broadcast` channel.
//!
//! The store can be taken offline, which fails every call with a transport
//! error and closes open subscriptions.

use crate::domain::entities::{DeviceInfo, DocumentChange, Record, SyncEvent};
use crate::domain::errors::SyncError;
use crate::domain::ports::{DocumentStream, RemoteStore};
use crate::domain::value_objects::{DeviceId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, mpsc, watch};

const FANOUT_CAPACITY: usize = 1024;
const STREAM_CAPACITY: usize = 256;

struct Namespace {
    events: Vec<SyncEvent>,
    last_sequence: u64,
    collections: HashMap<String, BTreeMap<String, Record>>,
    devices: BTreeMap<DeviceId, DeviceInfo>,
    backups: HashMap<String, Value>,
    fanout: broadcast::Sender<DocumentChange>,
}

impl Namespace {
    fn new() -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            events: Vec::new(),
            last_sequence: 0,
            collections: HashMap::new(),
            devices: BTreeMap::new(),
            backups: HashMap::new(),
            fanout,
        }
    }

    /// Apply an event to the materialized collection, last writer wins.
    fn materialize(&mut self, event: &SyncEvent) {
        let collection = self.collections.entry(event.store.clone()).or_default();
        let newer = collection
            .get(&event.item_id)
            .map_or(true, |existing| event.timestamp >= existing.last_modified);
        if !newer {
            return;
        }
        match event.to_record() {
            Some(record) => {
                collection.insert(record.id.clone(), record);
            }
            None => {
                collection.remove(&event.item_id);
            }
        }
    }
}

/// In-process remote store shared by every simulated device.
pub struct MemoryRemoteStore {
    users: DashMap<UserId, Namespace>,
    online: watch::Sender<bool>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        let (online, _) = watch::channel(true);
        Self {
            users: DashMap::new(),
            online,
        }
    }

    /// Bring the store online or take it offline.
    ///
    /// Going offline closes every open subscription.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
        tracing::debug!(online, "memory remote store connectivity changed");
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Insert documents directly, bypassing the event log.
    pub fn seed(&self, user: &UserId, collection: &str, records: Vec<Record>) {
        let mut ns = self.namespace(user);
        let target = ns.collections.entry(collection.to_string()).or_default();
        for record in records {
            target.insert(record.id.clone(), record);
        }
    }

    /// Every event published for the user, in receive order.
    pub fn events(&self, user: &UserId) -> Vec<SyncEvent> {
        self.users
            .get(user)
            .map(|ns| ns.events.clone())
            .unwrap_or_default()
    }

    /// Current materialized document, if any.
    pub fn document(&self, user: &UserId, collection: &str, id: &str) -> Option<Record> {
        self.users
            .get(user)
            .and_then(|ns| ns.collections.get(collection)?.get(id).cloned())
    }

    fn namespace(&self, user: &UserId) -> dashmap::mapref::one::RefMut<'_, UserId, Namespace> {
        self.users.entry(user.clone()).or_insert_with(Namespace::new)
    }

    fn ensure_online(&self) -> Result<(), SyncError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::Transport("remote store offline".to_string()))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn publish_event(&self, user: &UserId, event: &SyncEvent) -> Result<(), SyncError> {
        self.ensure_online()?;
        let mut ns = self.namespace(user);

        ns.last_sequence += 1;
        let stored = SyncEvent {
            sequence: Some(ns.last_sequence),
            ..event.clone()
        };
        ns.materialize(&stored);
        ns.events.push(stored.clone());

        // No receivers is not an error.
        let _ = ns.fanout.send(DocumentChange::added(stored));
        Ok(())
    }

    async fn events_since(&self, user: &UserId, after: u64) -> Result<Vec<SyncEvent>, SyncError> {
        self.ensure_online()?;
        Ok(self
            .users
            .get(user)
            .map(|ns| {
                ns.events
                    .iter()
                    .filter(|e| e.sequence.unwrap_or(0) > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn subscribe(&self, user: &UserId, after: u64) -> Result<DocumentStream, SyncError> {
        self.ensure_online()?;

        // Subscribe before taking the replay snapshot so nothing published in
        // between is lost; duplicates are possible and tolerated.
        let (mut live, replay) = {
            let ns = self.namespace(user);
            let live = ns.fanout.subscribe();
            let replay: Vec<SyncEvent> = ns
                .events
                .iter()
                .filter(|e| e.sequence.unwrap_or(0) > after)
                .cloned()
                .collect();
            (live, replay)
        };

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let mut online = self.online.subscribe();
        let user = user.clone();

        tokio::spawn(async move {
            for event in replay {
                if tx.send(DocumentChange::added(event)).await.is_err() {
                    return;
                }
            }

            loop {
                tokio::select! {
                    changed = online.changed() => {
                        if changed.is_err() || !*online.borrow() {
                            tracing::debug!(user = %user, "subscription closed: store offline");
                            return;
                        }
                    }
                    received = live.recv() => match received {
                        Ok(change) => {
                            if tx.send(change).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(user = %user, skipped, "subscriber lagged behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn count(&self, user: &UserId, collection: &str) -> Result<usize, SyncError> {
        self.ensure_online()?;
        Ok(self
            .users
            .get(user)
            .and_then(|ns| ns.collections.get(collection).map(|c| c.len()))
            .unwrap_or(0))
    }

    async fn fetch_page(
        &self,
        user: &UserId,
        collection: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Record>, SyncError> {
        self.ensure_online()?;
        Ok(self
            .users
            .get(user)
            .and_then(|ns| {
                ns.collections.get(collection).map(|c| {
                    c.values()
                        .skip(offset)
                        .take(limit)
                        .cloned()
                        .collect::<Vec<_>>()
                })
            })
            .unwrap_or_default())
    }

    async fn write_batch(
        &self,
        user: &UserId,
        collection: &str,
        records: &[Record],
    ) -> Result<(), SyncError> {
        self.ensure_online()?;
        self.seed(user, collection, records.to_vec());
        Ok(())
    }

    async fn upsert_device(&self, user: &UserId, device: &DeviceInfo) -> Result<(), SyncError> {
        self.ensure_online()?;
        self.namespace(user)
            .devices
            .insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn touch_device(
        &self,
        user: &UserId,
        device: &DeviceId,
        last_seen: u64,
    ) -> Result<bool, SyncError> {
        self.ensure_online()?;
        let mut ns = self.namespace(user);
        match ns.devices.get_mut(device) {
            Some(entry) => {
                entry.last_seen = last_seen;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_devices(&self, user: &UserId) -> Result<Vec<DeviceInfo>, SyncError> {
        self.ensure_online()?;
        Ok(self
            .users
            .get(user)
            .map(|ns| ns.devices.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_backup(&self, user: &UserId, backup_id: &str) -> Result<Value, SyncError> {
        self.ensure_online()?;
        self.users
            .get(user)
            .and_then(|ns| ns.backups.get(backup_id).cloned())
            .ok_or_else(|| SyncError::Rejected(format!("backup {} not found", backup_id)))
    }

    async fn upload_backup(
        &self,
        user: &UserId,
        backup_id: &str,
        backup: &Value,
    ) -> Result<(), SyncError> {
        self.ensure_online()?;
        self.namespace(user)
            .backups
            .insert(backup_id.to_string(), backup.clone());
        Ok(())
    }
}
