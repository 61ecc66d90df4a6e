//! HTTP Remote Store
//!
//! Implements RemoteStore against the backend REST API. Every resource lives
//! under `/v1/users/{userId}/`:
//!
//! - `sync_events`            event log (POST to publish, GET with `after`)
//! - `{collection}`           paged documents (`limit`/`offset`)
//! - `{collection}/batch`     batched writes
//! - `devices`, `devices/{id}` device registry
//! - `backups/{id}`           stored backup snapshots
//!
//! List responses use the envelope `{ "data": [...], "pagination": { "total": n } }`.
//! The API stamps every stored event with its receive `sequence`. It has no
//! push channel, so `subscribe` polls the event log by sequence.
//!
//! Only 408, 429 and 5xx responses are transient; any other error status is
//! a permanent rejection.

use crate::application::config::ConfigError;
use crate::domain::entities::{DeviceInfo, DocumentChange, Record, SyncEvent};
use crate::domain::errors::SyncError;
use crate::domain::ports::{DocumentStream, RemoteStore};
use crate::domain::value_objects::{DeviceId, UserId};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_PAGE_SIZE: usize = 500;
const STREAM_CAPACITY: usize = 256;

/// How requests authenticate against the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `X-API-Key` header
    ApiKey(String),
    /// `Authorization: Bearer` header
    Bearer(String),
    Anonymous,
}

impl Credentials {
    /// An API key takes precedence over an access token.
    pub fn from_parts(api_key: Option<String>, access_token: Option<String>) -> Self {
        match (api_key, access_token) {
            (Some(key), _) if !key.is_empty() => Self::ApiKey(key),
            (_, Some(token)) if !token.is_empty() => Self::Bearer(token),
            _ => Self::Anonymous,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Anonymous)
    }
}

/// Connection settings for [`HttpRemoteStore`].
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    /// Base URL, without trailing slash (e.g. "https://api.example.com")
    pub base_url: String,
    pub credentials: Credentials,
    pub timeout: Duration,
    /// Interval between polls of the event log while subscribed
    pub poll_interval: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            credentials: Credentials::Anonymous,
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    total: usize,
}

/// REST client to the remote document store.
#[derive(Clone)]
pub struct HttpRemoteStore {
    config: HttpRemoteConfig,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(mut config: HttpRemoteConfig) -> Result<Self, SyncError> {
        config.base_url = config.base_url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match &config.credentials {
            Credentials::ApiKey(key) => {
                let value = HeaderValue::from_str(key).map_err(|_| ConfigError::InvalidCredentials)?;
                headers.insert("X-API-Key", value);
            }
            Credentials::Bearer(token) => {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| ConfigError::InvalidCredentials)?;
                headers.insert(AUTHORIZATION, value);
            }
            Credentials::Anonymous => {}
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { config, client })
    }

    fn url(&self, user: &UserId, resource: &str) -> String {
        format!("{}/v1/users/{}/{}", self.config.base_url, user, resource)
    }

    /// Map error statuses onto the sync error taxonomy.
    async fn check(response: Response) -> Result<Response, SyncError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::AuthenticationRequired);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("remote store returned {}: {}", status, body);
        if is_transient(status) {
            Err(SyncError::Transport(message))
        } else {
            Err(SyncError::Rejected(message))
        }
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Envelope<T>, SyncError> {
        let response = self.client.get(url).query(query).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn publish_event(&self, user: &UserId, event: &SyncEvent) -> Result<(), SyncError> {
        let response = self
            .client
            .post(self.url(user, "sync_events"))
            .json(event)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn events_since(&self, user: &UserId, after: u64) -> Result<Vec<SyncEvent>, SyncError> {
        let url = self.url(user, "sync_events");
        let mut events = Vec::new();
        let mut offset = 0;

        loop {
            let page: Envelope<SyncEvent> = self
                .get_page(
                    &url,
                    &[
                        ("after", after.to_string()),
                        ("limit", EVENT_PAGE_SIZE.to_string()),
                        ("offset", offset.to_string()),
                    ],
                )
                .await?;

            let received = page.data.len();
            events.extend(page.data);
            offset += received;

            let exhausted = match page.pagination {
                Some(p) => offset >= p.total,
                None => true,
            };
            if received < EVENT_PAGE_SIZE || exhausted {
                break;
            }
        }

        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn subscribe(&self, user: &UserId, after: u64) -> Result<DocumentStream, SyncError> {
        // First poll runs inline so authentication errors reach the caller.
        let initial = self.events_since(user, after).await?;

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let store = self.clone();
        let user = user.clone();

        tokio::spawn(async move {
            let mut cursor = PollCursor::new(after);
            let mut batch = initial;

            loop {
                for event in cursor.advance(batch) {
                    if tx.send(DocumentChange::added(event)).await.is_err() {
                        return;
                    }
                }

                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(store.config.poll_interval) => {}
                }

                batch = match store.events_since(&user, cursor.after()).await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(user = %user, "event poll failed, closing subscription: {}", e);
                        return;
                    }
                };
            }
        });

        Ok(rx)
    }

    async fn count(&self, user: &UserId, collection: &str) -> Result<usize, SyncError> {
        let page: Envelope<Value> = self
            .get_page(
                &self.url(user, collection),
                &[("limit", "1".to_string()), ("offset", "0".to_string())],
            )
            .await?;
        Ok(page.pagination.map_or(page.data.len(), |p| p.total))
    }

    async fn fetch_page(
        &self,
        user: &UserId,
        collection: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Record>, SyncError> {
        let page: Envelope<Record> = self
            .get_page(
                &self.url(user, collection),
                &[("limit", limit.to_string()), ("offset", offset.to_string())],
            )
            .await?;
        Ok(page.data)
    }

    async fn write_batch(
        &self,
        user: &UserId,
        collection: &str,
        records: &[Record],
    ) -> Result<(), SyncError> {
        let response = self
            .client
            .post(self.url(user, &format!("{}/batch", collection)))
            .json(&json!({ "data": records }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn upsert_device(&self, user: &UserId, device: &DeviceInfo) -> Result<(), SyncError> {
        let response = self
            .client
            .put(self.url(user, &format!("devices/{}", device.id)))
            .json(device)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn touch_device(
        &self,
        user: &UserId,
        device: &DeviceId,
        last_seen: u64,
    ) -> Result<bool, SyncError> {
        let response = self
            .client
            .patch(self.url(user, &format!("devices/{}", device)))
            .json(&json!({ "lastSeen": last_seen }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    async fn list_devices(&self, user: &UserId) -> Result<Vec<DeviceInfo>, SyncError> {
        let page: Envelope<DeviceInfo> = self.get_page(&self.url(user, "devices"), &[]).await?;
        Ok(page.data)
    }

    async fn fetch_backup(&self, user: &UserId, backup_id: &str) -> Result<Value, SyncError> {
        let response = self
            .client
            .get(self.url(user, &format!("backups/{}", backup_id)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn upload_backup(
        &self,
        user: &UserId,
        backup_id: &str,
        backup: &Value,
    ) -> Result<(), SyncError> {
        let response = self
            .client
            .put(self.url(user, &format!("backups/{}", backup_id)))
            .json(backup)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Tracks the poll position so each event is forwarded once per subscription.
#[derive(Debug)]
struct PollCursor {
    after: u64,
}

impl PollCursor {
    fn new(after: u64) -> Self {
        Self { after }
    }

    fn after(&self) -> u64 {
        self.after
    }

    /// Keep the events past the cursor and move the cursor to the last one.
    fn advance(&mut self, events: Vec<SyncEvent>) -> Vec<SyncEvent> {
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            let Some(sequence) = event.sequence else {
                tracing::warn!(event_id = %event.id, "event without sequence ignored");
                continue;
            };
            if sequence <= self.after {
                continue;
            }
            self.after = sequence;
            fresh.push(event);
        }
        fresh
    }
}
