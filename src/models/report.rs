//! Operation results: statistics, health, import and purge reports.

use crate::config::CapacityLimits;
use crate::storage::PoolStats;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Counts and limits of the stored collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Stored decisions.
    pub decisions: usize,
    /// Stored patterns.
    pub patterns: usize,
    /// Stored context keys.
    pub context_keys: usize,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
    /// Configured capacities.
    pub limits: CapacityLimits,
}

impl MemoryStats {
    /// Percentage of decision capacity in use.
    #[must_use]
    pub fn decisions_used_percent(&self) -> f64 {
        percent(self.decisions, self.limits.max_decisions)
    }

    /// Percentage of pattern capacity in use.
    #[must_use]
    pub fn patterns_used_percent(&self) -> f64 {
        percent(self.patterns, self.limits.max_patterns)
    }

    /// Percentage of context capacity in use.
    #[must_use]
    pub fn context_used_percent(&self) -> f64 {
        percent(self.context_keys, self.limits.max_context_keys)
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(used: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    used as f64 / capacity as f64 * 100.0
}

/// Snapshot of the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Operations admitted per window.
    pub max_ops: usize,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Operations admitted in the current window.
    pub current_usage: usize,
    /// Operations still admissible in the current window.
    pub remaining: usize,
    /// Whether admissions survive restarts.
    pub durable: bool,
}

impl RateLimitStatus {
    /// Fraction of the window budget in use, `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.max_ops == 0 {
            return 0.0;
        }
        self.current_usage as f64 / self.max_ops as f64
    }
}

/// Result of an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Decisions imported.
    pub decisions: usize,
    /// Patterns imported.
    pub patterns: usize,
    /// Context keys imported.
    pub context: usize,
    /// Records skipped for invalid keys or empty required fields.
    pub skipped: usize,
    /// Records evicted afterwards to respect capacity.
    pub evicted: usize,
}

/// Rows removed by a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    /// Decisions deleted.
    pub decisions: usize,
    /// Patterns deleted.
    pub patterns: usize,
    /// Context keys deleted.
    pub context: usize,
}

/// Result of a purge request.
#[derive(Debug)]
pub enum PurgeOutcome {
    /// No token was supplied; one was issued and must be echoed back.
    ConfirmationRequired {
        /// Token to pass to the confirming call.
        token: SecretString,
        /// How long the token stays valid.
        expires_in: Duration,
    },
    /// The purge ran.
    Purged(PurgeReport),
}

impl PurgeOutcome {
    /// Returns the issued token, if this outcome carries one.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::ConfirmationRequired { token, .. } => Some(token.expose_secret()),
            Self::Purged(_) => None,
        }
    }
}

/// Overall or per-check health.
///
/// Ordered from best to worst so the overall status is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Everything passed.
    Healthy,
    /// Working, but close to a limit or under pressure.
    Degraded,
    /// A required check failed.
    Unhealthy,
}

impl HealthStatus {
    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// One health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Probe name.
    pub name: String,
    /// Probe outcome.
    pub status: HealthStatus,
    /// Human-readable detail.
    pub detail: String,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status across all checks.
    pub status: HealthStatus,
    /// Crate version.
    pub version: String,
    /// Database location.
    pub db_path: String,
    /// Individual probes, in execution order.
    pub checks: Vec<HealthCheck>,
    /// Pool counters at check time.
    pub pool: PoolStats,
    /// Limiter status at check time.
    pub rate_limit: RateLimitStatus,
}

impl HealthReport {
    /// Starts a healthy report.
    #[must_use]
    pub fn new(db_path: impl Into<String>, pool: PoolStats, rate_limit: RateLimitStatus) -> Self {
        Self {
            status: HealthStatus::Healthy,
            version: env!("CARGO_PKG_VERSION").to_string(),
            db_path: db_path.into(),
            checks: Vec::new(),
            pool,
            rate_limit,
        }
    }

    /// Records a probe and folds its status into the overall status.
    pub fn record(&mut self, name: &str, status: HealthStatus, detail: impl Into<String>) {
        self.status = self.status.max(status);
        self.checks.push(HealthCheck {
            name: name.to_string(),
            status,
            detail: detail.into(),
        });
    }

    /// Returns the named probe.
    #[must_use]
    pub fn check(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|check| check.name == name)
    }
}
