//! # Memkeep
//!
//! Project-scoped persistent memory for tool-calling assistants.
//!
//! Memkeep stores decisions, named patterns and key/value context in an
//! embedded `SQLite` database and guards that store with a small
//! resource-management layer:
//!
//! - A bounded connection pool with temporary overflow and a capped wait queue
//! - A sliding-window rate limiter that can survive restarts
//! - A two-step confirmation token for irreversible purges
//! - Capacity-bounded collections with eviction applied inside the insert
//!   transaction
//!
//! ## Example
//!
//! ```rust,ignore
//! use memkeep::{MemkeepConfig, ResourceCoordinator, DecisionInput};
//!
//! let coordinator = ResourceCoordinator::open(MemkeepConfig::load_default());
//! let id = coordinator.remember_decision(DecisionInput {
//!     decision: "Use SQLite in WAL mode".to_string(),
//!     rationale: "Single writer, many readers".to_string(),
//!     ..Default::default()
//! })?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use std::fmt;
use thiserror::Error as ThisError;

// Module declarations
pub mod clock;
pub mod config;
pub mod models;
pub mod observability;
pub mod security;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MemkeepConfig;
pub use models::{
    ContextEntry, Decision, DecisionId, DecisionInput, ExportDocument, HealthReport, HealthStatus,
    ImportReport, MemoryStats, Pattern, PatternInput, PurgeOutcome, PurgeReport, RateLimitStatus,
};
pub use security::{ConfirmationOutcome, ConfirmationTokenGuard, RateLimitConfig, RateLimiter};
pub use services::{Operation, ResourceCoordinator};
pub use storage::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection};

/// Why the connection pool refused to hand out a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    /// Pooled and temporary handles were all in use and the wait queue was full.
    QueueFull,
    /// The caller waited in the queue for the full wait timeout.
    WaitTimeout,
    /// The pool was closed while the caller was waiting.
    Closed,
}

impl ExhaustionReason {
    /// Returns a stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::WaitTimeout => "wait_timeout",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for memkeep operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Missing fields, invalid keys, oversized or malformed imports |
/// | `RateLimited` | The sliding-window limiter rejected the call |
/// | `ResourceExhausted` | Pool and wait queue saturated, or the wait timed out |
/// | `TokenMismatch` | A purge confirmation did not match the pending token |
/// | `TokenExpiredOrAbsent` | A purge confirmation arrived with no live token |
/// | `TransientStore` | Busy/locked store errors persisted through every retry |
/// | `OperationFailed` | Any other store or I/O failure inside the crate |
/// | `Internal` | An unexpected failure surfaced at the coordinator boundary |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Structural errors are deterministic and never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The rate limiter rejected the operation.
    #[error("rate limit exceeded: max {max_ops} operations per {window_secs}s")]
    RateLimited {
        /// Configured operations per window.
        max_ops: usize,
        /// Window length in seconds.
        window_secs: u64,
    },

    /// No store handle could be obtained.
    ///
    /// Retryable later; callers decide whether to back off or fail the request.
    #[error("resource exhausted ({reason}): {detail}")]
    ResourceExhausted {
        /// Which backpressure stage rejected the caller.
        reason: ExhaustionReason,
        /// Human-readable detail.
        detail: String,
    },

    /// A confirmation token did not match the pending one.
    ///
    /// The expected token is deliberately not carried here.
    #[error("confirmation token mismatch ({remaining_secs}s left on the pending token)")]
    TokenMismatch {
        /// Seconds until the pending token expires.
        remaining_secs: u64,
    },

    /// No confirmation token is pending, or it expired.
    #[error("no pending confirmation token (absent or expired); request a new one")]
    TokenExpiredOrAbsent,

    /// The store stayed busy or locked after every retry.
    #[error("store busy during '{operation}': {cause}")]
    TransientStore {
        /// The operation that was retried.
        operation: String,
        /// The last underlying cause.
        cause: String,
    },

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Generic failure returned to callers; details are only in the logs.
    #[error("internal error (request id {request_id})")]
    Internal {
        /// Correlation id to find the logged cause.
        request_id: String,
    },
}

impl Error {
    /// Returns a stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "VALIDATION_ERROR",
            Self::RateLimited { .. } => "RATE_LIMIT_ERROR",
            Self::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Self::TokenMismatch { .. } => "TOKEN_MISMATCH",
            Self::TokenExpiredOrAbsent => "TOKEN_EXPIRED",
            Self::TransientStore { .. } => "STORE_BUSY",
            Self::OperationFailed { .. } | Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Returns true if retrying the same call later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ResourceExhausted { .. } | Self::TransientStore { .. }
        )
    }

    pub(crate) fn operation(operation: &str, cause: impl fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for memkeep operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in milliseconds.
///
/// Falls back to 0 if the system clock is before the Unix epoch.
///
/// # Examples
///
/// ```rust
/// use memkeep::current_timestamp_millis;
///
/// assert!(current_timestamp_millis() > 0);
/// ```
#[must_use]
pub fn current_timestamp_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
