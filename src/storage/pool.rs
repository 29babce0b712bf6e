//! Bounded connection pool with temporary overflow and a capped wait queue.
//!
//! Checkout priority:
//!
//! 1. An idle pooled handle (probed for liveness, replaced when dead).
//! 2. A vacant pooled slot, refilled with a fresh handle.
//! 3. A temporary handle while fewer than `max_temp` are outstanding.
//! 4. A place in the wait queue, bounded by `queue_capacity` and
//!    `wait_timeout`.
//!
//! ```text
//!  acquire ──> idle? ──yes──> PooledConnection (Pooled)
//!                │no
//!                v
//!           temp slot? ──yes──> PooledConnection (Temporary)
//!                │no
//!                v
//!           queue full? ──yes──> ResourceExhausted(QueueFull)
//!                │no
//!                v
//!           wait (Condvar, deadline) ──timeout──> ResourceExhausted(WaitTimeout)
//! ```
//!
//! Handles are returned through [`PooledConnection`]'s `Drop`, so every exit
//! path (return, `?`, unwinding panic) releases them. Each release wakes one
//! waiter.

use super::connection::acquire_lock;
use crate::config::EnvLookup;
use crate::config::env::{parse_u64, parse_usize};
use crate::{Error, ExhaustionReason, Result};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const EXHAUSTION_WARNING_INTERVAL: Duration = Duration::from_secs(10);
const EXHAUSTION_WARNING_JITTER_MS: u64 = 5000;

/// Opens store handles on behalf of the pool.
pub trait ConnectionFactory: Send + Sync {
    /// The handle type handed out by the pool.
    type Connection: Send;

    /// Opens a new handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    fn connect(&self) -> Result<Self::Connection>;

    /// Lightweight liveness probe run on idle handles at checkout.
    fn is_alive(&self, _conn: &Self::Connection) -> bool {
        true
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of pooled handles.
    pub size: usize,
    /// Maximum temporary handles outstanding at once.
    pub max_temp: usize,
    /// Maximum callers waiting at once.
    pub queue_capacity: usize,
    /// How long a queued caller waits before giving up.
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            max_temp: 10,
            queue_capacity: 50,
            wait_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Creates a pool configuration.
    #[must_use]
    pub const fn new(
        size: usize,
        max_temp: usize,
        queue_capacity: usize,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            size,
            max_temp,
            queue_capacity,
            wait_timeout,
        }
    }

    /// Applies overrides.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `MEMKEEP_POOL_SIZE` | Pooled handles | 5 |
    /// | `MEMKEEP_POOL_MAX_TEMP` | Temporary overflow | 10 |
    /// | `MEMKEEP_POOL_QUEUE_CAPACITY` | Waiting callers | 50 |
    /// | `MEMKEEP_POOL_WAIT_TIMEOUT_MS` | Wait timeout | 30000 |
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvLookup<'_>) -> Self {
        if let Some(size) = parse_usize(env, "MEMKEEP_POOL_SIZE") {
            self.size = size.max(1);
        }
        if let Some(max_temp) = parse_usize(env, "MEMKEEP_POOL_MAX_TEMP") {
            self.max_temp = max_temp;
        }
        if let Some(capacity) = parse_usize(env, "MEMKEEP_POOL_QUEUE_CAPACITY") {
            self.queue_capacity = capacity;
        }
        if let Some(ms) = parse_u64(env, "MEMKEEP_POOL_WAIT_TIMEOUT_MS") {
            self.wait_timeout = Duration::from_millis(ms);
        }
        self
    }

    /// Sets the number of pooled handles.
    #[must_use]
    pub const fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Sets the temporary overflow limit.
    #[must_use]
    pub const fn with_max_temp(mut self, max_temp: usize) -> Self {
        self.max_temp = max_temp;
        self
    }

    /// Sets the wait queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the wait timeout.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct PoolStats {
    /// Configured pooled handles.
    pub size: usize,
    /// Idle pooled handles.
    pub available: usize,
    /// Pooled handles currently checked out.
    pub checked_out: usize,
    /// Temporary handles outstanding.
    pub temp_active: usize,
    /// Temporary handles created since start.
    pub temp_created_total: u64,
    /// Times the pooled handles were all busy.
    pub exhaustion_count: u64,
    /// Callers currently queued.
    pub waiting: usize,
    /// Configured temporary limit.
    pub max_temp: usize,
    /// Configured queue capacity.
    pub queue_capacity: usize,
    /// Whether the pooled handles have been opened.
    pub initialized: bool,
}

/// Where a handle came from, and where it goes on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Returned to the idle set on release.
    Pooled,
    /// Closed on release.
    Temporary,
}

#[derive(Debug)]
enum InitState {
    Uninitialized,
    Ready,
    Failed(String),
}

struct PoolState<C> {
    idle: Vec<C>,
    /// Pooled slots whose handle was lost and not yet reopened.
    vacancies: usize,
    checked_out: usize,
    temp_active: usize,
    waiting: usize,
    temp_created_total: u64,
    exhaustion_count: u64,
    next_warning_at: Option<Instant>,
    init: InitState,
    closed: bool,
}

enum Slot<C> {
    Idle(C),
    Vacancy,
    Temporary,
}

/// Bounded pool of store handles.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    released: Condvar,
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Creates a pool. No handles are opened until the first acquire.
    #[must_use]
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let config = PoolConfig {
            size: config.size.max(1),
            ..config
        };
        Self {
            factory,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(config.size),
                vacancies: 0,
                checked_out: 0,
                temp_active: 0,
                waiting: 0,
                temp_created_total: 0,
                exhaustion_count: 0,
                next_warning_at: None,
                init: InitState::Uninitialized,
                closed: false,
            }),
            released: Condvar::new(),
            config,
        }
    }

    /// Returns the pool configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the handle factory.
    #[must_use]
    pub const fn factory(&self) -> &F {
        &self.factory
    }

    /// Opens the pooled handles now instead of on first acquire.
    ///
    /// # Errors
    ///
    /// Returns the initialization failure, which is remembered and returned by
    /// every later call.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.lock_state();
        self.ensure_initialized(&mut state)
    }

    /// Checks out a handle, waiting in the queue if necessary.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceExhausted`] with [`ExhaustionReason::QueueFull`] when
    ///   every handle is busy and the queue is full
    /// - [`Error::ResourceExhausted`] with [`ExhaustionReason::WaitTimeout`]
    ///   when the wait timeout elapses
    /// - [`Error::ResourceExhausted`] with [`ExhaustionReason::Closed`] after
    ///   [`close`](Self::close)
    /// - the factory's error when a handle cannot be opened
    pub fn acquire(&self) -> Result<PooledConnection<'_, F>> {
        let start = Instant::now();
        let mut state = self.lock_state();
        self.ensure_initialized(&mut state)?;

        if state.closed {
            return Err(self.reject(ExhaustionReason::Closed, "pool is closed".to_string()));
        }

        if let Some(slot) = self.try_take(&mut state) {
            drop(state);
            return self.checkout(slot, start);
        }

        if state.waiting >= self.config.queue_capacity {
            let detail = format!(
                "{} pooled and {} temporary handles busy, {} callers queued",
                self.config.size, state.temp_active, state.waiting
            );
            drop(state);
            return Err(self.reject(ExhaustionReason::QueueFull, detail));
        }

        state.waiting += 1;
        let deadline = start + self.config.wait_timeout;
        tracing::debug!(waiting = state.waiting, "Waiting for a pooled handle");

        loop {
            let now = Instant::now();
            if now >= deadline {
                state.waiting -= 1;
                drop(state);
                let detail = format!(
                    "no handle became available within {}ms",
                    self.config.wait_timeout.as_millis()
                );
                return Err(self.reject(ExhaustionReason::WaitTimeout, detail));
            }

            state = match self.released.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => {
                    tracing::warn!(lock = "pool", "Mutex was poisoned, recovering");
                    metrics::counter!("mutex_poison_recovery_total", "lock" => "pool")
                        .increment(1);
                    poisoned.into_inner().0
                },
            };

            if state.closed {
                state.waiting -= 1;
                drop(state);
                return Err(
                    self.reject(ExhaustionReason::Closed, "pool closed while waiting".to_string())
                );
            }

            if let Some(slot) = self.try_take(&mut state) {
                state.waiting -= 1;
                drop(state);
                return self.checkout(slot, start);
            }
        }
    }

    /// Returns current pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            size: self.config.size,
            available: state.idle.len(),
            checked_out: state.checked_out,
            temp_active: state.temp_active,
            temp_created_total: state.temp_created_total,
            exhaustion_count: state.exhaustion_count,
            waiting: state.waiting,
            max_temp: self.config.max_temp,
            queue_capacity: self.config.queue_capacity,
            initialized: matches!(state.init, InitState::Ready),
        }
    }

    /// Closes idle handles and refuses further checkouts.
    ///
    /// Queued callers are woken and fail with [`ExhaustionReason::Closed`].
    /// Handles still checked out are closed when released.
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock_state();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        let closed = idle.len();
        drop(idle);
        self.released.notify_all();
        metrics::gauge!("pool_available_connections").set(0.0);
        tracing::info!(closed, "Connection pool closed");
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        acquire_lock(&self.state, "pool")
    }

    fn ensure_initialized(&self, state: &mut PoolState<F::Connection>) -> Result<()> {
        match &state.init {
            InitState::Ready => return Ok(()),
            InitState::Failed(cause) => {
                return Err(Error::operation("pool_initialize", cause));
            },
            InitState::Uninitialized => {},
        }

        let mut opened = Vec::with_capacity(self.config.size);
        for _ in 0..self.config.size {
            match self.factory.connect() {
                Ok(conn) => opened.push(conn),
                Err(e) => {
                    let cause = e.to_string();
                    tracing::error!(error = %cause, "Connection pool initialization failed");
                    metrics::counter!("pool_initialization_failures_total").increment(1);
                    state.init = InitState::Failed(cause.clone());
                    return Err(Error::operation("pool_initialize", cause));
                },
            }
        }

        state.idle = opened;
        state.init = InitState::Ready;
        metrics::gauge!("pool_available_connections").set(self.config.size as f64);
        tracing::info!(
            size = self.config.size,
            max_temp = self.config.max_temp,
            queue_capacity = self.config.queue_capacity,
            "Connection pool initialized"
        );
        Ok(())
    }

    fn try_take(&self, state: &mut PoolState<F::Connection>) -> Option<Slot<F::Connection>> {
        if let Some(conn) = state.idle.pop() {
            state.checked_out += 1;
            metrics::gauge!("pool_available_connections").set(state.idle.len() as f64);
            return Some(Slot::Idle(conn));
        }
        if state.vacancies > 0 {
            state.vacancies -= 1;
            state.checked_out += 1;
            return Some(Slot::Vacancy);
        }
        if state.temp_active < self.config.max_temp {
            state.temp_active += 1;
            state.temp_created_total += 1;
            state.exhaustion_count += 1;
            metrics::counter!("pool_exhaustion_total").increment(1);
            metrics::counter!("pool_temp_connections_created_total").increment(1);
            metrics::gauge!("pool_temp_connections_active").set(state.temp_active as f64);
            Self::maybe_warn_exhausted(state);
            return Some(Slot::Temporary);
        }
        None
    }

    /// Logs pool exhaustion at most once per interval plus random jitter.
    fn maybe_warn_exhausted(state: &mut PoolState<F::Connection>) {
        let now = Instant::now();
        if state.next_warning_at.is_some_and(|at| now < at) {
            return;
        }
        let jitter = Duration::from_millis(rand::random::<u64>() % (EXHAUSTION_WARNING_JITTER_MS + 1));
        state.next_warning_at = Some(now + EXHAUSTION_WARNING_INTERVAL + jitter);
        tracing::warn!(
            temp_active = state.temp_active,
            exhaustion_count = state.exhaustion_count,
            "Connection pool exhausted, using temporary handles"
        );
    }

    fn checkout(&self, slot: Slot<F::Connection>, start: Instant) -> Result<PooledConnection<'_, F>> {
        let result = match slot {
            Slot::Idle(conn) => {
                if self.factory.is_alive(&conn) {
                    Ok(self.wrap(conn, Provenance::Pooled))
                } else {
                    tracing::warn!("Discarding dead pooled handle");
                    metrics::counter!("pool_dead_connections_total").increment(1);
                    drop(conn);
                    self.open_pooled()
                }
            },
            Slot::Vacancy => self.open_pooled(),
            Slot::Temporary => match self.factory.connect() {
                Ok(conn) => Ok(self.wrap(conn, Provenance::Temporary)),
                Err(e) => {
                    let mut state = self.lock_state();
                    state.temp_active -= 1;
                    metrics::gauge!("pool_temp_connections_active").set(state.temp_active as f64);
                    drop(state);
                    self.released.notify_one();
                    Err(e)
                },
            },
        };

        if result.is_ok() {
            metrics::histogram!("pool_wait_duration_ms").record(start.elapsed().as_secs_f64() * 1000.0);
        }
        result
    }

    /// Opens a replacement for a pooled slot already counted as checked out.
    ///
    /// On failure the slot becomes a vacancy for a later acquire to refill.
    fn open_pooled(&self) -> Result<PooledConnection<'_, F>> {
        match self.factory.connect() {
            Ok(conn) => Ok(self.wrap(conn, Provenance::Pooled)),
            Err(e) => {
                let mut state = self.lock_state();
                state.checked_out -= 1;
                state.vacancies += 1;
                drop(state);
                tracing::warn!(error = %e, "Could not reopen pooled handle, slot left vacant");
                self.released.notify_one();
                Err(e)
            },
        }
    }

    fn wrap(&self, conn: F::Connection, provenance: Provenance) -> PooledConnection<'_, F> {
        PooledConnection {
            pool: self,
            conn: Some(conn),
            provenance,
        }
    }

    fn release(&self, conn: F::Connection, provenance: Provenance) {
        let mut state = self.lock_state();
        let discard = match provenance {
            Provenance::Pooled => {
                state.checked_out = state.checked_out.saturating_sub(1);
                if state.closed {
                    Some(conn)
                } else {
                    state.idle.push(conn);
                    metrics::gauge!("pool_available_connections").set(state.idle.len() as f64);
                    None
                }
            },
            Provenance::Temporary => {
                state.temp_active = state.temp_active.saturating_sub(1);
                metrics::gauge!("pool_temp_connections_active").set(state.temp_active as f64);
                Some(conn)
            },
        };
        drop(state);
        drop(discard);
        self.released.notify_one();
    }

    fn reject(&self, reason: ExhaustionReason, detail: String) -> Error {
        metrics::counter!("pool_rejections_total", "reason" => reason.as_str()).increment(1);
        tracing::warn!(reason = %reason, detail = %detail, "Connection pool rejected caller");
        Error::ResourceExhausted { reason, detail }
    }
}

/// Exclusive handle checked out of a [`ConnectionPool`].
///
/// Released on drop: pooled handles return to the idle set, temporary handles
/// are closed.
pub struct PooledConnection<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    conn: Option<F::Connection>,
    provenance: Provenance,
}

impl<F: ConnectionFactory> PooledConnection<'_, F> {
    /// Returns where this handle came from.
    #[must_use]
    pub const fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Returns true for overflow handles that close on release.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self.provenance, Provenance::Temporary)
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<'_, F> {
    type Target = F::Connection;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Self::Target {
        // Only taken in Drop.
        self.conn.as_ref().expect("handle present until drop")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<'_, F> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("handle present until drop")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<'_, F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.provenance);
        }
    }
}
