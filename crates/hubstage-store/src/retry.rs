//! Bounded retry with exponential backoff.
//!
//! Only [`StoreError::is_transient`] failures are retried. Authorization,
//! not-found, conflict and unsupported errors return immediately.

use std::time::Duration;

use tracing::warn;

use crate::error::StoreError;

/// How many times, and how patiently, a remote call is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each following one.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `f`, retrying transient failures according to `policy`.
///
/// `operation` names the call in log events.
///
/// # Errors
/// Returns the last error once retries are exhausted, or the first
/// non-transient error.
pub fn with_retry<T, F>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut retry = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                warn!(
                    operation,
                    attempt = retry + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient remote error, retrying"
                );
                std::thread::sleep(delay);
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
