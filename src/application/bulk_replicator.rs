//! Bulk Replicator
//!
//! Staged full download of the replicated collections into the local replica:
//!
//! `Idle -> Downloading(medications) -> Downloading(logs) -> Downloading(insights)
//!  -> Downloading(stats) -> Complete`
//!
//! Each collection is fetched page by page and written with one `put_batch`
//! per page while the collection is locked. Remote records not newer than the
//! local copy are skipped, so an unpublished local write is never replaced by
//! an older remote version. A failure in any stage aborts the run and returns
//! the replicator to `Idle`; stages already committed stay committed.

use crate::application::quota_monitor::StorageQuotaMonitor;
use crate::application::ProgressSender;
use crate::domain::entities::{interpolate_percent, BulkStage, DownloadProgress, Record};
use crate::domain::errors::SyncError;
use crate::domain::ports::{RemoteStore, ReplicaStore};
use crate::domain::value_objects::UserId;
use crate::infrastructure::{retry, CancelHandle, RetryConfig, WriteLocks};
use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle of the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkState {
    Idle,
    Downloading(BulkStage),
    Complete,
}

/// Summary of a finished bulk download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub items_downloaded: usize,
    pub collections: usize,
}

/// Progress reporter enforcing a non-decreasing percent.
struct Reporter<'a> {
    sink: Option<&'a ProgressSender<DownloadProgress>>,
    percent: u8,
}

impl Reporter<'_> {
    fn emit(&mut self, stage: BulkStage, percent: u8, done: usize, total: usize) {
        // 100 is reserved for the terminal stage.
        let percent = if stage == BulkStage::Complete {
            100
        } else {
            percent.min(99)
        };
        self.percent = self.percent.max(percent);

        if let Some(sink) = self.sink {
            let _ = sink.send(DownloadProgress {
                stage,
                percent: self.percent,
                items_downloaded: done,
                total_items: total,
                current_store: stage.collection().map(str::to_string),
            });
        }
    }
}

/// Populates the local replica from the remote store.
pub struct BulkReplicator {
    user: UserId,
    remote: Arc<dyn RemoteStore>,
    replica: Arc<dyn ReplicaStore>,
    locks: Arc<WriteLocks>,
    quota: StorageQuotaMonitor,
    page_size: usize,
    threshold_percent: u8,
    retry: RetryConfig,
    state: Mutex<BulkState>,
}

impl BulkReplicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user: UserId,
        remote: Arc<dyn RemoteStore>,
        replica: Arc<dyn ReplicaStore>,
        locks: Arc<WriteLocks>,
        quota: StorageQuotaMonitor,
        page_size: usize,
        threshold_percent: u8,
        retry: RetryConfig,
    ) -> Self {
        Self {
            user,
            remote,
            replica,
            locks,
            quota,
            page_size: page_size.max(1),
            threshold_percent,
            retry,
            state: Mutex::new(BulkState::Idle),
        }
    }

    pub fn state(&self) -> BulkState {
        *self.state.lock()
    }

    fn set_state(&self, state: BulkState) {
        *self.state.lock() = state;
    }

    /// Download every replicated collection.
    ///
    /// Can be re-run after `Complete` to refresh the replica.
    pub async fn run(
        &self,
        cancel: &CancelHandle,
        progress: Option<&ProgressSender<DownloadProgress>>,
    ) -> Result<BulkReport, SyncError> {
        {
            let mut state = self.state.lock();
            if matches!(*state, BulkState::Downloading(_)) {
                return Err(SyncError::AlreadyRunning("bulk download"));
            }
            *state = BulkState::Downloading(BulkStage::Medications);
        }

        let result = self.download(cancel, progress).await;
        match &result {
            Ok(report) => {
                self.set_state(BulkState::Complete);
                tracing::info!(
                    items = report.items_downloaded,
                    "bulk download complete"
                );
            }
            Err(e) => {
                self.set_state(BulkState::Idle);
                tracing::error!("bulk download aborted: {}", e);
            }
        }
        result
    }

    async fn download(
        &self,
        cancel: &CancelHandle,
        progress: Option<&ProgressSender<DownloadProgress>>,
    ) -> Result<BulkReport, SyncError> {
        // Refuse before anything is fetched or written.
        self.quota.ensure_capacity(self.threshold_percent).await?;

        let mut reporter = Reporter {
            sink: progress,
            percent: 0,
        };
        let mut report = BulkReport::default();

        for stage in BulkStage::DOWNLOAD_ORDER {
            cancel.check()?;
            self.set_state(BulkState::Downloading(stage));
            report.items_downloaded += self.download_stage(stage, cancel, &mut reporter).await?;
            report.collections += 1;
        }

        reporter.emit(BulkStage::Complete, 100, report.items_downloaded, report.items_downloaded);
        Ok(report)
    }

    async fn download_stage(
        &self,
        stage: BulkStage,
        cancel: &CancelHandle,
        reporter: &mut Reporter<'_>,
    ) -> Result<usize, SyncError> {
        let Some(collection) = stage.collection() else {
            return Ok(0);
        };
        let range = stage.percent_range();

        let total = retry(&format!("count {}", collection), &self.retry, cancel, || {
            self.remote.count(&self.user, collection)
        })
        .await?;

        tracing::info!(stage = %stage, total, "downloading collection");
        reporter.emit(stage, range.0, 0, total);

        let _collection_lock = self.locks.lock_collection(collection).await;
        let mut downloaded = 0;

        loop {
            let page = retry(&format!("fetch {}", collection), &self.retry, cancel, || {
                self.remote
                    .fetch_page(&self.user, collection, downloaded, self.page_size)
            })
            .await?;

            let fetched = page.len();
            if fetched == 0 {
                break;
            }

            // A page that arrives after cancellation is discarded.
            cancel.check()?;
            let newer = self.newer_than_local(collection, page).await?;
            if !newer.is_empty() {
                self.replica.put_batch(collection, newer).await?;
            }

            downloaded += fetched;
            reporter.emit(
                stage,
                interpolate_percent(range, downloaded, total.max(downloaded)),
                downloaded,
                total.max(downloaded),
            );
            tracing::debug!(stage = %stage, downloaded, total, "page stored");

            if fetched < self.page_size {
                break;
            }
        }

        reporter.emit(stage, range.1, downloaded, total.max(downloaded));
        Ok(downloaded)
    }

    /// Remote records that win over the local copy (local wins ties).
    async fn newer_than_local(
        &self,
        collection: &str,
        page: Vec<Record>,
    ) -> Result<Vec<Record>, SyncError> {
        let mut newer = Vec::with_capacity(page.len());
        for record in page {
            match self.replica.get(collection, &record.id).await? {
                Some(local) if local.last_modified >= record.last_modified => {
                    tracing::debug!(
                        collection,
                        item_id = %record.id,
                        local = local.last_modified,
                        remote = record.last_modified,
                        "local copy kept"
                    );
                }
                _ => newer.push(record),
            }
        }
        Ok(newer)
    }
}
