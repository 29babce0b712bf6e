//! Retry with exponential backoff for transient store errors.
//!
//! Only `SQLITE_BUSY` and `SQLITE_LOCKED` are retried. Everything else
//! (constraint violations, I/O errors, corrupt files) fails on the first
//! attempt.
//!
//! ```text
//! attempt 1 ──busy──> sleep(base ± jitter) ──> attempt 2 ──busy──> sleep(base·m ± jitter) ──> ...
//!                                                    └──ok──> return
//! ```

use crate::config::EnvLookup;
use crate::config::env::{parse_u64, parse_usize};
use crate::observability::current_request_id;
use crate::{Error, Result};
use rusqlite::ErrorCode;
use std::time::Duration;

/// Retry policy for transient store errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between retries.
    pub multiplier: f64,
    /// Relative jitter, e.g. `0.25` for ±25%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Applies `MEMKEEP_RETRY_MAX_ATTEMPTS`, `MEMKEEP_RETRY_BASE_DELAY_MS` and
    /// `MEMKEEP_RETRY_MAX_DELAY_MS`.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvLookup<'_>) -> Self {
        if let Some(attempts) = parse_usize(env, "MEMKEEP_RETRY_MAX_ATTEMPTS") {
            self.max_attempts = attempts.max(1);
        }
        if let Some(ms) = parse_u64(env, "MEMKEEP_RETRY_BASE_DELAY_MS") {
            self.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(env, "MEMKEEP_RETRY_MAX_DELAY_MS") {
            self.max_delay = Duration::from_millis(ms);
        }
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first retry delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.base_delay.as_secs_f64() * 1000.0 * factor)
            .min(self.max_delay.as_secs_f64() * 1000.0);
        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::random::<f64>().mul_add(2.0, -1.0) * self.jitter;
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

/// Returns true for `SQLITE_BUSY` and `SQLITE_LOCKED`.
#[must_use]
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Runs `call`, retrying transient store errors per `policy`.
///
/// # Errors
///
/// - [`Error::TransientStore`] when every attempt hit a transient error
/// - [`Error::OperationFailed`] on the first non-transient error
pub fn retry_transient<T, F>(policy: &RetryPolicy, operation: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call() {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "Store operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(e) if is_transient(&e) => {
                metrics::counter!("storage_transient_errors_total", "operation" => operation)
                    .increment(1);
                if attempt >= attempts {
                    let request_id = current_request_id();
                    tracing::warn!(
                        operation,
                        attempts,
                        request_id = request_id.as_deref().unwrap_or("-"),
                        error = %e,
                        "Store stayed busy after retries"
                    );
                    return Err(Error::TransientStore {
                        operation: operation.to_string(),
                        cause: e.to_string(),
                    });
                }
                let delay = policy.jittered(policy.backoff(attempt));
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Transient store error, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            },
            Err(e) => return Err(Error::operation(operation, e)),
        }
    }
}
