//! Sliding-window rate limiter.
//!
//! Admission trims timestamps older than `now - window`, admits while fewer
//! than `max_ops` remain, and records `now` for every admitted call. Trim,
//! count and record share one critical section, so no window ever holds more
//! than `max_ops` admissions.
//!
//! With a [`RateLog`] attached the limiter survives restarts: the log seeds
//! the window on construction and every admission is appended to it after
//! the lock is released. Log failures are logged and never change a
//! decision.
//!
//! Appends and `reset` are ordered through a reset epoch: an admission
//! recorded before a reset is either cleared by it or never written.

use crate::clock::{Clock, SystemClock};
use crate::config::EnvLookup;
use crate::config::env::{parse_u64, parse_usize};
use crate::config::parse_bool;
use crate::models::RateLimitStatus;
use crate::storage::{RateLog, SqliteRateLog, acquire_lock};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default operations per window.
pub const DEFAULT_MAX_OPS: usize = 100;

/// Default window length in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Default interval between durable-log cleanups in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum admissions per window.
    pub max_ops: usize,
    /// Window length.
    pub window: Duration,
    /// Whether admissions are recorded in the durable log.
    pub persist: bool,
    /// Minimum time between durable-log cleanups.
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_ops: DEFAULT_MAX_OPS,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            persist: false,
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

impl RateLimitConfig {
    /// Applies `MEMKEEP_RATE_LIMIT`, `MEMKEEP_RATE_LIMIT_WINDOW_SECS`,
    /// `MEMKEEP_PERSIST_RATE_LIMIT` and
    /// `MEMKEEP_RATE_LIMIT_CLEANUP_INTERVAL_SECS`.
    ///
    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvLookup<'_>) -> Self {
        if let Some(max_ops) = parse_usize(env, "MEMKEEP_RATE_LIMIT") {
            self.max_ops = max_ops.max(1);
        }
        if let Some(secs) = parse_u64(env, "MEMKEEP_RATE_LIMIT_WINDOW_SECS") {
            self.window = Duration::from_secs(secs.max(1));
        }
        if let Some(persist) = env("MEMKEEP_PERSIST_RATE_LIMIT") {
            self.persist = parse_bool(&persist);
        }
        if let Some(secs) = parse_u64(env, "MEMKEEP_RATE_LIMIT_CLEANUP_INTERVAL_SECS") {
            self.cleanup_interval = Duration::from_secs(secs);
        }
        self
    }

    /// Sets the admissions per window.
    #[must_use]
    pub const fn with_max_ops(mut self, max_ops: usize) -> Self {
        self.max_ops = max_ops;
        self
    }

    /// Sets the window length.
    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Enables or disables the durable log.
    #[must_use]
    pub const fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Sets the minimum time between durable-log cleanups.
    #[must_use]
    pub const fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

struct Window {
    timestamps: VecDeque<u64>,
    max_ops: usize,
    window_ms: u64,
    /// Bumped by every reset.
    epoch: u64,
}

impl Window {
    fn cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.window_ms)
    }

    fn trim(&mut self, now: u64) {
        let cutoff = self.cutoff(now);
        while self.timestamps.front().is_some_and(|&ts| ts < cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn remaining(&self) -> usize {
        self.max_ops.saturating_sub(self.timestamps.len())
    }
}

/// Sliding-window admission control.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    window: Mutex<Window>,
    log: Option<Box<dyn RateLog>>,
    /// Epoch of the last reset applied to the log; held across appends.
    log_epoch: Mutex<u64>,
    cleanup_interval_ms: u64,
    last_cleanup_ms: AtomicU64,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("durable", &self.log.is_some())
            .field("cleanup_interval_ms", &self.cleanup_interval_ms)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates an in-memory limiter.
    #[must_use]
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            clock,
            window: Mutex::new(Window {
                timestamps: VecDeque::new(),
                max_ops: config.max_ops.max(1),
                window_ms: duration_millis(config.window).max(1000),
                epoch: 0,
            }),
            log: None,
            log_epoch: Mutex::new(0),
            cleanup_interval_ms: duration_millis(config.cleanup_interval),
            last_cleanup_ms: AtomicU64::new(now),
        }
    }

    /// Creates a limiter seeded from, and recording to, `log`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be loaded.
    pub fn with_log(
        config: &RateLimitConfig,
        clock: Arc<dyn Clock>,
        log: Box<dyn RateLog>,
    ) -> Result<Self> {
        let mut limiter = Self::new(config, clock);
        let now = limiter.clock.now_millis();
        {
            let mut window = acquire_lock(&limiter.window, "rate_limiter");
            let seeded = log.load(window.cutoff(now))?;
            tracing::info!(
                operations = seeded.len(),
                max_ops = window.max_ops,
                "Loaded rate limit operations from durable log"
            );
            window.timestamps = seeded.into();
        }
        limiter.log = Some(log);
        Ok(limiter)
    }

    /// Builds the limiter described by `config`.
    ///
    /// A durable limiter stores its log in `db_path`. If that log cannot be
    /// opened the limiter falls back to in-memory with a warning.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig, db_path: &Path, clock: Arc<dyn Clock>) -> Self {
        if !config.persist {
            return Self::new(config, clock);
        }
        let durable = SqliteRateLog::open(db_path).and_then(|log| {
            Self::with_log(config, Arc::clone(&clock), Box::new(log))
        });
        match durable {
            Ok(limiter) => {
                tracing::info!(path = %db_path.display(), "Using durable rate limiter");
                limiter
            },
            Err(e) => {
                tracing::warn!(
                    path = %db_path.display(),
                    error = %e,
                    "Durable rate limiter unavailable, falling back to in-memory"
                );
                metrics::counter!("rate_limiter_fallback_total").increment(1);
                Self::new(config, clock)
            },
        }
    }

    /// Admits or rejects one operation.
    pub fn check(&self) -> bool {
        let now = self.clock.now_millis();
        let (cutoff, epoch) = {
            let mut window = acquire_lock(&self.window, "rate_limiter");
            window.trim(now);
            if window.timestamps.len() >= window.max_ops {
                drop(window);
                metrics::counter!("rate_limit_rejections_total").increment(1);
                return false;
            }
            window.timestamps.push_back(now);
            (window.cutoff(now), window.epoch)
        };

        if let Some(log) = &self.log {
            self.append_unless_reset(log.as_ref(), now, epoch);
            self.maybe_cleanup(log.as_ref(), now, cutoff);
        }
        true
    }

    /// Appends `now` unless a reset happened after it was admitted.
    fn append_unless_reset(&self, log: &dyn RateLog, now: u64, epoch: u64) {
        let log_epoch = acquire_lock(&self.log_epoch, "rate_log_epoch");
        if *log_epoch != epoch {
            tracing::debug!("Skipping append of admission cleared by reset");
            return;
        }
        if let Err(e) = log.append(now) {
            tracing::warn!(error = %e, "Failed to persist rate limit operation");
        }
    }

    fn maybe_cleanup(&self, log: &dyn RateLog, now: u64, cutoff: u64) {
        let last = self.last_cleanup_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.cleanup_interval_ms {
            return;
        }
        // One thread per interval wins the cleanup.
        if self
            .last_cleanup_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        match log.cleanup(cutoff) {
            Ok(removed) => tracing::debug!(removed, "Cleaned up expired rate limit entries"),
            Err(e) => tracing::warn!(error = %e, "Failed to clean up rate limit entries"),
        }
    }

    /// Admissions still available in the current window.
    pub fn remaining(&self) -> usize {
        let now = self.clock.now_millis();
        let mut window = acquire_lock(&self.window, "rate_limiter");
        window.trim(now);
        window.remaining()
    }

    /// Clears the window and the durable log.
    ///
    /// The window lock is held until the log is cleared, so admissions made
    /// after the reset are never wiped by it.
    pub fn reset(&self) {
        let mut window = acquire_lock(&self.window, "rate_limiter");
        window.timestamps.clear();
        window.epoch = window.epoch.wrapping_add(1);
        if let Some(log) = &self.log {
            let mut log_epoch = acquire_lock(&self.log_epoch, "rate_log_epoch");
            *log_epoch = window.epoch;
            if let Err(e) = log.clear() {
                tracing::warn!(error = %e, "Failed to clear durable rate limit log");
            }
        }
        drop(window);
        tracing::info!("Rate limiter reset");
    }

    /// Changes the limits at runtime; recorded admissions are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `max_ops < 1` or `window_secs < 1`.
    pub fn configure(
        &self,
        max_ops: Option<usize>,
        window_secs: Option<u64>,
    ) -> Result<RateLimitStatus> {
        if max_ops.is_some_and(|n| n < 1) {
            return Err(Error::InvalidInput("max_ops must be at least 1".to_string()));
        }
        if window_secs.is_some_and(|s| s < 1) {
            return Err(Error::InvalidInput(
                "window_secs must be at least 1".to_string(),
            ));
        }
        {
            let mut window = acquire_lock(&self.window, "rate_limiter");
            if let Some(max_ops) = max_ops {
                window.max_ops = max_ops;
            }
            if let Some(secs) = window_secs {
                window.window_ms = secs.saturating_mul(1000);
            }
            tracing::info!(
                max_ops = window.max_ops,
                window_secs = window.window_ms / 1000,
                "Rate limiter reconfigured"
            );
        }
        Ok(self.status())
    }

    /// Current limits and usage.
    pub fn status(&self) -> RateLimitStatus {
        let now = self.clock.now_millis();
        let mut window = acquire_lock(&self.window, "rate_limiter");
        window.trim(now);
        let status = RateLimitStatus {
            max_ops: window.max_ops,
            window_secs: window.window_ms / 1000,
            current_usage: window.timestamps.len(),
            remaining: window.remaining(),
            durable: self.log.is_some(),
        };
        drop(window);
        metrics::gauge!("rate_limit_remaining").set(status.remaining as f64);
        status
    }

    /// Whether admissions are recorded durably.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.log.is_some()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default(), Arc::new(SystemClock))
    }
}
