//! Bounded retry for store calls.
//!
//! ```rust,ignore
//! use carbonsync_core::retry::{RetryPolicy, with_retry};
//!
//! let policy = RetryPolicy::info_lookup();
//! let info = with_retry(&policy, || store.get_info(name)).await?;
//! ```
//!
//! Every error is retried, including `Error::NotFound`: a metric that is
//! being created on another node may only appear on a later attempt.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;

/// A fixed number of attempts with a fixed pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub attempts: u32,
    /// Pause after each failed attempt except the last.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::info_lookup()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Policy for info lookups before a merge: 5 attempts, 100ms apart.
    #[must_use]
    pub fn info_lookup() -> Self {
        Self::fixed(5, Duration::from_millis(100))
    }
}

/// Run `operation` until it succeeds or the policy's attempts run out.
/// The last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if attempt >= attempts => {
                warn!(attempt, error = %e, "Operation failed after all retry attempts");
                return Err(e);
            }
            Err(e) => {
                debug!(
                    attempt,
                    delay_ms = policy.interval.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}
