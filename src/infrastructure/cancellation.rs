//! Cancellation
//!
//! First-class cancellation for long-running runs (bulk download, restore,
//! background loops). Work in flight is raced against [`CancelHandle::cancelled`]
//! so a pending fetch is abandoned instead of committed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::domain::errors::SyncError;

/// Cloneable cancellation flag shared between a run and its caller.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::debug!("cancellation requested");
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Run `fut` unless cancelled first; cancellation wins ties.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(SyncError::Cancelled),
            result = fut => result,
        }
    }

    /// Fail with [`SyncError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
