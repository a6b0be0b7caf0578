//! Exponential backoff for remote store round trips.
//!
//! Only transport-level failures are retried. A statement the target
//! store rejected is never re-sent.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff policy, configurable per remote store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 has no delay.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let millis = (self.initial_delay_ms as f64) * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }
}

/// Returns true for failures worth another attempt: rate limiting, IO and
/// connection trouble, and server-side 5xx responses.
#[must_use]
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::RateLimit(_) | Error::Io(_) => true,
        Error::Http(e) => e.is_timeout() || e.is_connect(),
        Error::SourceConnection(msg) | Error::TargetConnection(msg) => {
            ["500", "502", "503", "504", "timeout", "connection reset"]
                .iter()
                .any(|marker| msg.to_lowercase().contains(marker))
        }
        _ => false,
    }
}

/// Returns true only when the request never reached the server. Safe to
/// retry for statements that write.
#[must_use]
pub fn is_unsent(error: &Error) -> bool {
    matches!(error, Error::Http(e) if e.is_connect())
}

/// Runs `operation` until it succeeds, fails with a non-transient error,
/// or runs out of retries.
///
/// # Errors
///
/// Returns the last error seen.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, label: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(policy, label, is_transient, operation).await
}

/// Like [`with_retry`], retrying only errors `retryable` accepts.
///
/// # Errors
///
/// Returns the last error seen.
pub async fn with_retry_if<F, Fut, T>(
    policy: &RetryPolicy,
    label: &str,
    retryable: fn(&Error) -> bool,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{}: succeeded after {} retries", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if retryable(&e) && attempt < policy.max_retries => {
                attempt += 1;
                let delay = match &e {
                    Error::RateLimit(secs) => Duration::from_secs(*secs)
                        .min(Duration::from_millis(policy.max_delay_ms)),
                    _ => policy.delay_for_attempt(attempt),
                };
                warn!(
                    "{}: {} (retry {}/{} in {:?})",
                    label, e, attempt, policy.max_retries, delay
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
