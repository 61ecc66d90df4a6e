//! Retry with exponential backoff.
//!
//! Only retryable errors ([`SyncError::is_retryable`]) are retried; everything
//! else is returned to the caller on the first failure.

use crate::domain::errors::SyncError;
use crate::infrastructure::cancellation::CancelHandle;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff schedule for transport operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Reconnection of long-lived subscriptions: never give up, cap at 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
            max_retries: None,
        }
    }

    /// Individual requests: 3 quick attempts, then surface the error.
    #[must_use]
    pub fn query() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_retries: Some(3),
        }
    }

    /// Minimal delays for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_retries: Some(3),
        }
    }

    /// Delay after `delay`, grown by `factor` and capped.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Add up to 10% random jitter so devices do not reconnect in lockstep.
fn jittered(delay: Duration) -> Duration {
    let jitter_ms = (delay.as_millis() as u64) / 10;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Run `operation` until it succeeds, fails with a non-retryable error,
/// exhausts the retry budget, or `cancel` fires.
pub async fn retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancelHandle,
    mut operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0usize;

    loop {
        match cancel.run(operation()).await {
            Ok(value) => {
                if attempts > 0 {
                    tracing::info!("{} succeeded after {} retries", operation_name, attempts);
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempts += 1;
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        tracing::warn!("{} failed after {} attempts: {}", operation_name, attempts, e);
                        return Err(e);
                    }
                }

                tracing::warn!(
                    "{} failed (attempt {}): {}, retrying in {:?}",
                    operation_name,
                    attempts,
                    e,
                    delay
                );

                cancel
                    .run(async {
                        tokio::time::sleep(jittered(delay)).await;
                        Ok(())
                    })
                    .await?;
                delay = config.next_delay(delay);
            }
        }
    }
}
