//! Resource coordinator.
//!
//! Composes the pool, the rate limiter, the confirmation guard and the
//! bounded collections behind one operation surface. A mutating call runs:
//!
//! ```text
//! limiter.check() ──> [purge: token guard] ──> pool.acquire() ──> txn (retried) ──> release
//! ```
//!
//! Every call gets a fresh request id carried in a thread-local request
//! context and a `tracing` span. Unexpected failures are logged with that id
//! and surfaced as [`Error::Internal`].

use super::validation::{sanitize_input, validate_key};
use crate::clock::{Clock, SystemClock};
use crate::config::MemkeepConfig;
use crate::models::{
    Decision, DecisionId, DecisionInput, ExportDocument, HealthReport, HealthStatus, ImportData,
    ImportDocument, ImportReport, ImportedDecision, ImportedPattern, MemoryStats, Pattern,
    PatternInput, PurgeOutcome, RateLimitStatus,
};
use crate::observability::{RequestContext, enter_request_context};
use crate::security::{ConfirmationOutcome, ConfirmationTokenGuard, RateLimiter};
use crate::storage::memory_store;
use crate::storage::{
    ConnectionPool, PoolStats, SqliteConnectionFactory, retry_transient,
};
use crate::{Error, Result};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default number of decisions returned by recall.
pub const DEFAULT_RECALL_LIMIT: usize = 20;

/// Largest recall page.
pub const MAX_RECALL_LIMIT: usize = 100;

/// Longest keyword accepted by recall, in characters.
const MAX_KEYWORD_CHARS: usize = 100;

/// Capacity usage above which health degrades.
const CAPACITY_WARN_PERCENT: f64 = 90.0;

/// Limiter utilization above which health degrades.
const RATE_LIMIT_WARN_UTILIZATION: f64 = 0.8;

/// Operations exposed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Append a decision.
    RememberDecision,
    /// Search decisions.
    RecallDecisions,
    /// Upsert a pattern.
    StorePattern,
    /// List patterns.
    GetPatterns,
    /// Upsert a context value.
    SetContext,
    /// List context.
    GetContext,
    /// Bulk import.
    ImportMemory,
    /// Delete everything (two-step).
    PurgeMemory,
    /// Counts and limits.
    MemoryStats,
    /// Full dump.
    ExportMemory,
    /// Store probes.
    HealthCheck,
    /// Limiter snapshot.
    RateLimitStatus,
    /// Limiter reconfiguration.
    RateLimitConfigure,
    /// Limiter reset.
    RateLimitReset,
    /// Pool snapshot.
    PoolStats,
}

impl Operation {
    /// Every operation, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::RememberDecision,
        Self::RecallDecisions,
        Self::StorePattern,
        Self::GetPatterns,
        Self::SetContext,
        Self::GetContext,
        Self::ImportMemory,
        Self::PurgeMemory,
        Self::MemoryStats,
        Self::ExportMemory,
        Self::HealthCheck,
        Self::RateLimitStatus,
        Self::RateLimitConfigure,
        Self::RateLimitReset,
        Self::PoolStats,
    ];

    /// Stable name used in logs and metrics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RememberDecision => "remember_decision",
            Self::RecallDecisions => "recall_decisions",
            Self::StorePattern => "store_pattern",
            Self::GetPatterns => "get_patterns",
            Self::SetContext => "set_context",
            Self::GetContext => "get_context",
            Self::ImportMemory => "import_memory",
            Self::PurgeMemory => "purge_memory",
            Self::MemoryStats => "memory_stats",
            Self::ExportMemory => "export_memory",
            Self::HealthCheck => "health_check",
            Self::RateLimitStatus => "rate_limit_status",
            Self::RateLimitConfigure => "rate_limit_configure",
            Self::RateLimitReset => "rate_limit_reset",
            Self::PoolStats => "pool_stats",
        }
    }

    /// Whether the call consumes rate limit budget.
    #[must_use]
    pub const fn is_rate_limited(self) -> bool {
        matches!(
            self,
            Self::RememberDecision
                | Self::RecallDecisions
                | Self::StorePattern
                | Self::GetPatterns
                | Self::SetContext
                | Self::GetContext
                | Self::ImportMemory
                | Self::PurgeMemory
        )
    }

    /// Whether the call destroys data.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::PurgeMemory)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn record_operation_metrics(operation: &'static str, elapsed: Duration, status: &'static str) {
    metrics::counter!(
        "memkeep_operations_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "memkeep_operation_duration_ms",
        "operation" => operation,
        "status" => status
    )
    .record(elapsed.as_secs_f64() * 1000.0);
}

/// Entry point for all memory operations.
///
/// Build once with [`ResourceCoordinator::open`] and share by `Arc`.
pub struct ResourceCoordinator {
    config: MemkeepConfig,
    pool: ConnectionPool<SqliteConnectionFactory>,
    limiter: RateLimiter,
    guard: ConfirmationTokenGuard,
}

impl fmt::Debug for ResourceCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCoordinator")
            .field("db_path", &self.config.db_path)
            .field("pool", &self.pool)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl ResourceCoordinator {
    /// Builds every component from `config` using the system clock.
    ///
    /// The pool opens no handles until the first store operation.
    #[must_use]
    pub fn open(config: MemkeepConfig) -> Self {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Builds every component with an explicit clock.
    #[must_use]
    pub fn open_with_clock(config: MemkeepConfig, clock: Arc<dyn Clock>) -> Self {
        let factory = SqliteConnectionFactory::new(config.db_path.clone());
        let pool = ConnectionPool::new(factory, config.pool.clone());
        let limiter = RateLimiter::from_config(&config.rate_limit, &config.db_path, Arc::clone(&clock));
        let guard = ConfirmationTokenGuard::new(config.purge_token_ttl, clock);

        tracing::info!(
            db_path = %config.db_path.display(),
            pool_size = config.pool.size,
            max_temp = config.pool.max_temp,
            rate_limit = config.rate_limit.max_ops,
            durable_rate_limit = limiter.is_durable(),
            "Resource coordinator ready"
        );

        Self {
            config,
            pool,
            limiter,
            guard,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &MemkeepConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Boundary
    // ------------------------------------------------------------------------

    fn run<T>(&self, op: Operation, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let context = RequestContext::new(op.name());
        let request_id = context.request_id().to_string();
        let span = tracing::info_span!(
            "memkeep.operation",
            operation = context.operation(),
            request_id = %request_id
        );
        let _entered = span.enter();
        let _context = enter_request_context(context.clone());

        let result = if op.is_rate_limited() && !self.limiter.check() {
            let status = self.limiter.status();
            Err(Error::RateLimited {
                max_ops: status.max_ops,
                window_secs: status.window_secs,
            })
        } else {
            body()
        };

        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics(op.name(), context.elapsed(), status);
        result.map_err(|e| Self::at_boundary(op, e, &request_id))
    }

    fn at_boundary(op: Operation, err: Error, request_id: &str) -> Error {
        match err {
            Error::OperationFailed { operation, cause } => {
                tracing::error!(
                    operation = op.name(),
                    failed_step = %operation,
                    error = %cause,
                    request_id,
                    "Operation failed"
                );
                Error::Internal {
                    request_id: request_id.to_string(),
                }
            },
            Error::RateLimited { .. } | Error::ResourceExhausted { .. } | Error::TransientStore { .. } => {
                tracing::warn!(operation = op.name(), error = %err, "Operation rejected");
                err
            },
            other => {
                tracing::debug!(operation = op.name(), error = %other, "Operation refused");
                other
            },
        }
    }

    fn with_connection<T>(
        &self,
        step: &'static str,
        mut call: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.pool.acquire()?;
        retry_transient(&self.config.retry, step, || call(&mut *conn))
    }

    // ------------------------------------------------------------------------
    // Decisions, patterns, context
    // ------------------------------------------------------------------------

    /// Records a decision; old decisions are evicted at capacity.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if the decision or rationale is empty
    /// - [`Error::RateLimited`], [`Error::ResourceExhausted`],
    ///   [`Error::TransientStore`] or [`Error::Internal`]
    pub fn remember_decision(&self, input: DecisionInput) -> Result<DecisionId> {
        self.run(Operation::RememberDecision, || {
            let input = DecisionInput {
                decision: sanitize_input(&input.decision),
                rationale: sanitize_input(&input.rationale),
                context: sanitize_input(&input.context),
                alternatives: sanitize_input(&input.alternatives),
            };
            if input.decision.is_empty() || input.rationale.is_empty() {
                return Err(Error::InvalidInput(
                    "decision and rationale are required".to_string(),
                ));
            }

            let capacity = self.config.capacity.max_decisions;
            let (id, evicted) = self.with_connection("insert_decision", |conn| {
                memory_store::insert_decision(conn, &input, capacity)
            })?;
            tracing::info!(decision_id = %id, evicted, "Recorded decision");
            Ok(id)
        })
    }

    /// Returns the newest decisions, optionally filtered by keyword.
    ///
    /// `limit` is clamped to `1..=100`; wildcards in `keyword` match literally.
    ///
    /// # Errors
    ///
    /// Returns backpressure or store errors.
    pub fn recall_decisions(&self, keyword: Option<&str>, limit: usize) -> Result<Vec<Decision>> {
        self.run(Operation::RecallDecisions, || {
            let limit = limit.clamp(1, MAX_RECALL_LIMIT);
            let keyword = keyword
                .map(|k| sanitize_input(&k.chars().take(MAX_KEYWORD_CHARS).collect::<String>()))
                .filter(|k| !k.is_empty());
            self.with_connection("search_decisions", |conn| {
                memory_store::search_decisions(conn, keyword.as_deref(), limit)
            })
        })
    }

    /// Inserts or updates a pattern; the least recently updated is evicted at capacity.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if the name is not a valid key or the description is empty
    /// - backpressure or store errors
    pub fn store_pattern(&self, input: PatternInput) -> Result<()> {
        self.run(Operation::StorePattern, || {
            if !validate_key(&input.name) {
                return Err(Error::InvalidInput(format!(
                    "invalid pattern name '{}': use letters, digits, '_', '-' or '.' (max 100)",
                    input.name
                )));
            }
            let input = PatternInput {
                name: input.name,
                description: sanitize_input(&input.description),
                example: sanitize_input(&input.example),
                when_to_use: sanitize_input(&input.when_to_use),
            };
            if input.description.is_empty() {
                return Err(Error::InvalidInput("description is required".to_string()));
            }

            let capacity = self.config.capacity.max_patterns;
            let evicted = self.with_connection("upsert_pattern", |conn| {
                memory_store::upsert_pattern(conn, &input, capacity)
            })?;
            tracing::info!(pattern = %input.name, evicted, "Stored pattern");
            Ok(())
        })
    }

    /// Lists patterns by name.
    ///
    /// # Errors
    ///
    /// Returns backpressure or store errors.
    pub fn get_patterns(&self) -> Result<Vec<Pattern>> {
        self.run(Operation::GetPatterns, || {
            self.with_connection("list_patterns", |conn| memory_store::list_patterns(conn))
        })
    }

    /// Sets a context value; the least recently updated key is evicted at capacity.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if the key is invalid
    /// - backpressure or store errors
    pub fn set_context(&self, key: &str, value: &str) -> Result<()> {
        self.run(Operation::SetContext, || {
            if !validate_key(key) {
                return Err(Error::InvalidInput(format!(
                    "invalid context key '{key}': use letters, digits, '_', '-' or '.' (max 100)"
                )));
            }
            let value = sanitize_input(value);
            let capacity = self.config.capacity.max_context_keys;
            let evicted = self.with_connection("upsert_context", |conn| {
                memory_store::upsert_context(conn, key, &value, capacity)
            })?;
            tracing::info!(context_key = key, evicted, "Set context");
            Ok(())
        })
    }

    /// Returns every context value by key.
    ///
    /// # Errors
    ///
    /// Returns backpressure or store errors.
    pub fn get_context(&self) -> Result<BTreeMap<String, String>> {
        self.run(Operation::GetContext, || {
            let entries =
                self.with_connection("list_context", |conn| memory_store::list_context(conn))?;
            Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
        })
    }

    // ------------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------------

    /// Imports a JSON document in the export format.
    ///
    /// `merge == false` replaces all stored data. Records with invalid keys or
    /// missing required text are skipped and counted.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for oversized, malformed or over-limit documents
    /// - backpressure or store errors
    pub fn import_memory(&self, json: &str, merge: bool) -> Result<ImportReport> {
        self.run(Operation::ImportMemory, || {
            let (data, skipped) = self.prepare_import(json)?;
            let capacity = self.config.capacity;
            let mut report = self.with_connection("import", |conn| {
                memory_store::import_data(conn, &data, merge, &capacity)
            })?;
            report.skipped = skipped;
            tracing::info!(
                decisions = report.decisions,
                patterns = report.patterns,
                context = report.context,
                skipped = report.skipped,
                evicted = report.evicted,
                merge,
                "Imported memory"
            );
            Ok(report)
        })
    }

    fn prepare_import(&self, json: &str) -> Result<(ImportData, usize)> {
        let limits = &self.config.import;
        if json.len() > limits.max_json_bytes {
            return Err(Error::InvalidInput(format!(
                "import document is {} bytes, limit is {} (MEMKEEP_MAX_IMPORT_JSON_SIZE)",
                json.len(),
                limits.max_json_bytes
            )));
        }
        let document: ImportDocument = serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("invalid import data: {e}")))?;
        let data = document.data;

        let over_limit = [
            ("decisions", data.decisions.len(), limits.max_decisions, "MEMKEEP_MAX_IMPORT_DECISIONS"),
            ("patterns", data.patterns.len(), limits.max_patterns, "MEMKEEP_MAX_IMPORT_PATTERNS"),
            ("context keys", data.context.len(), limits.max_context_keys, "MEMKEEP_MAX_IMPORT_CONTEXT_KEYS"),
        ]
        .into_iter()
        .find(|(_, count, max, _)| count > max);
        if let Some((what, count, max, var)) = over_limit {
            return Err(Error::InvalidInput(format!(
                "import exceeds maximum {what} limit: {count} > {max} (set {var} to raise it)"
            )));
        }

        let mut skipped = 0;
        let decisions = data
            .decisions
            .into_iter()
            .filter_map(|d| {
                let record = ImportedDecision {
                    timestamp: d.timestamp,
                    decision: sanitize_input(&d.decision),
                    rationale: sanitize_input(&d.rationale),
                    context: sanitize_input(&d.context),
                    alternatives: sanitize_input(&d.alternatives),
                };
                let keep = !record.decision.is_empty() && !record.rationale.is_empty();
                if !keep {
                    skipped += 1;
                }
                keep.then_some(record)
            })
            .collect();
        let patterns = data
            .patterns
            .into_iter()
            .filter_map(|p| {
                if !validate_key(&p.name) {
                    skipped += 1;
                    return None;
                }
                Some(ImportedPattern {
                    name: p.name,
                    description: sanitize_input(&p.description),
                    example: sanitize_input(&p.example),
                    when_to_use: sanitize_input(&p.when_to_use),
                })
            })
            .collect();
        let context = data
            .context
            .into_iter()
            .filter_map(|(key, value)| {
                if validate_key(&key) {
                    Some((key, sanitize_input(&value)))
                } else {
                    skipped += 1;
                    None
                }
            })
            .collect();

        Ok((
            ImportData {
                decisions,
                patterns,
                context,
            },
            skipped,
        ))
    }

    /// Two-step purge of all stored data.
    ///
    /// Without `confirm` a token is issued and returned; nothing is deleted.
    /// With the matching token everything is deleted.
    ///
    /// # Errors
    ///
    /// - [`Error::TokenMismatch`] if `confirm` differs from the pending token
    /// - [`Error::TokenExpiredOrAbsent`] if no token is pending
    /// - backpressure or store errors
    pub fn purge_memory(&self, confirm: Option<&str>) -> Result<PurgeOutcome> {
        self.run(Operation::PurgeMemory, || {
            let Some(presented) = confirm else {
                let issued = self.guard.issue();
                tracing::warn!(
                    ttl_secs = issued.ttl.as_secs(),
                    "Purge requested, confirmation token issued"
                );
                return Ok(PurgeOutcome::ConfirmationRequired {
                    token: issued.token,
                    expires_in: issued.ttl,
                });
            };

            match self.guard.validate_and_consume(presented) {
                ConfirmationOutcome::Accepted => {},
                ConfirmationOutcome::Mismatch { remaining, .. } => {
                    tracing::warn!(
                        remaining_secs = remaining.as_secs(),
                        "Purge confirmation token mismatch"
                    );
                    return Err(Error::TokenMismatch {
                        remaining_secs: remaining.as_secs(),
                    });
                },
                ConfirmationOutcome::NoneOrExpired => return Err(Error::TokenExpiredOrAbsent),
            }

            let report = self.with_connection("purge", |conn| memory_store::purge_all(conn))?;
            tracing::warn!(
                decisions = report.decisions,
                patterns = report.patterns,
                context = report.context,
                "Purged all memory"
            );
            metrics::counter!("memory_purges_total").increment(1);
            Ok(PurgeOutcome::Purged(report))
        })
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Counts, limits and database size.
    ///
    /// # Errors
    ///
    /// Returns pool or store errors.
    pub fn memory_stats(&self) -> Result<MemoryStats> {
        self.run(Operation::MemoryStats, || self.collect_stats())
    }

    fn collect_stats(&self) -> Result<MemoryStats> {
        let counts = self.with_connection("counts", |conn| memory_store::counts(conn))?;
        Ok(self.stats_from_counts(counts))
    }

    fn stats_from_counts(&self, (decisions, patterns, context_keys): (usize, usize, usize)) -> MemoryStats {
        MemoryStats {
            decisions,
            patterns,
            context_keys,
            db_size_bytes: std::fs::metadata(&self.config.db_path).map_or(0, |m| m.len()),
            limits: self.config.capacity,
        }
    }

    fn check_store(&self, conn: &mut Connection, report: &mut HealthReport) {
        let retry = &self.config.retry;

        match retry_transient(retry, "ping", || memory_store::ping(conn)) {
            Ok(()) => report.record("database_connection", HealthStatus::Healthy, "ok"),
            Err(e) => report.record("database_connection", HealthStatus::Unhealthy, format!("failed: {e}")),
        }

        match retry_transient(retry, "integrity_check", || memory_store::integrity_check(conn)) {
            Ok(result) if result == "ok" => {
                report.record("database_integrity", HealthStatus::Healthy, result);
            },
            Ok(result) => report.record("database_integrity", HealthStatus::Degraded, result),
            Err(e) => report.record("database_integrity", HealthStatus::Unhealthy, format!("failed: {e}")),
        }

        match retry_transient(retry, "probe_write", || memory_store::probe_write(conn)) {
            Ok(()) => report.record("write_capability", HealthStatus::Healthy, "ok"),
            Err(e) => report.record("write_capability", HealthStatus::Unhealthy, format!("failed: {e}")),
        }

        match retry_transient(retry, "counts", || memory_store::counts(conn)) {
            Ok(counts) => {
                let stats = self.stats_from_counts(counts);
                let decisions = stats.decisions_used_percent();
                let patterns = stats.patterns_used_percent();
                let context = stats.context_used_percent();
                let detail = format!(
                    "decisions {decisions:.1}%, patterns {patterns:.1}%, context {context:.1}%"
                );
                if decisions.max(patterns).max(context) > CAPACITY_WARN_PERCENT {
                    report.record("capacity", HealthStatus::Degraded, format!("{detail}: approaching capacity limits"));
                } else {
                    report.record("capacity", HealthStatus::Healthy, detail);
                }
            },
            Err(e) => report.record("capacity", HealthStatus::Unhealthy, format!("failed: {e}")),
        }
    }

    /// Full dump of stored data.
    ///
    /// # Errors
    ///
    /// Returns pool or store errors.
    pub fn export_memory(&self) -> Result<ExportDocument> {
        self.run(Operation::ExportMemory, || {
            let data = self.with_connection("export", |conn| memory_store::export_data(conn))?;
            let stats = self.collect_stats()?;
            Ok(ExportDocument {
                version: env!("CARGO_PKG_VERSION").to_string(),
                exported_at: chrono::Utc::now().to_rfc3339(),
                project: self.project_name(),
                data,
                stats,
            })
        })
    }

    fn project_name(&self) -> String {
        self.config
            .db_path
            .file_stem()
            .map_or_else(|| "memkeep".to_string(), |s| s.to_string_lossy().into_owned())
    }

    /// Probes the store, capacity, pool and limiter.
    ///
    /// Probe failures are reported in the result, not as errors.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` keeps the boundary uniform.
    pub fn health_check(&self) -> Result<HealthReport> {
        self.run(Operation::HealthCheck, || {
            let mut report = HealthReport::new(
                self.config.db_path.display().to_string(),
                self.pool.stats(),
                self.limiter.status(),
            );

            // All store checks share one handle.
            match self.pool.acquire() {
                Ok(mut conn) => self.check_store(&mut conn, &mut report),
                Err(e) => {
                    let detail = format!("failed: {e}");
                    for component in ["database_connection", "database_integrity", "write_capability", "capacity"] {
                        report.record(component, HealthStatus::Unhealthy, detail.clone());
                    }
                },
            }

            let pool = self.pool.stats();
            if pool.exhaustion_count > 0 {
                report.record(
                    "connection_pool",
                    HealthStatus::Degraded,
                    format!(
                        "pool exhausted {} times; consider raising MEMKEEP_POOL_SIZE",
                        pool.exhaustion_count
                    ),
                );
            } else {
                report.record("connection_pool", HealthStatus::Healthy, "ok");
            }

            let utilization = report.rate_limit.utilization();
            if utilization > RATE_LIMIT_WARN_UTILIZATION {
                report.record(
                    "rate_limiter",
                    HealthStatus::Degraded,
                    format!(
                        "{:.0}% utilized; consider raising MEMKEEP_RATE_LIMIT",
                        utilization * 100.0
                    ),
                );
            } else {
                report.record("rate_limiter", HealthStatus::Healthy, "ok");
            }

            report.pool = pool;
            if report.status != HealthStatus::Healthy {
                tracing::warn!(status = report.status.as_str(), "Health check not healthy");
            }
            Ok(report)
        })
    }

    /// Limiter snapshot.
    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.limiter.status()
    }

    /// Changes limiter limits at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `max_ops < 1` or `window_secs < 1`.
    pub fn configure_rate_limit(
        &self,
        max_ops: Option<usize>,
        window_secs: Option<u64>,
    ) -> Result<RateLimitStatus> {
        self.run(Operation::RateLimitConfigure, || {
            self.limiter.configure(max_ops, window_secs)
        })
    }

    /// Clears recorded admissions.
    pub fn reset_rate_limit(&self) {
        self.limiter.reset();
    }

    /// Pool snapshot.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Closes pooled handles; later store operations fail.
    pub fn close(&self) {
        self.pool.close();
        tracing::info!("Resource coordinator closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CapacityLimits;
    use crate::security::RateLimitConfig;
    use secrecy::ExposeSecret;
    use std::time::Duration;

    fn coordinator(dir: &tempfile::TempDir) -> ResourceCoordinator {
        let config = MemkeepConfig::new().with_db_path(dir.path().join("memory.db"));
        ResourceCoordinator::open(config)
    }

    #[test]
    fn test_operation_table() {
        let limited: Vec<_> = Operation::ALL
            .into_iter()
            .filter(|op| op.is_rate_limited())
            .map(Operation::name)
            .collect();
        assert_eq!(
            limited,
            vec![
                "remember_decision",
                "recall_decisions",
                "store_pattern",
                "get_patterns",
                "set_context",
                "get_context",
                "import_memory",
                "purge_memory"
            ]
        );
        assert!(Operation::PurgeMemory.is_destructive());
        assert!(!Operation::ExportMemory.is_destructive());
    }

    #[test]
    fn test_remember_and_recall() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir);

        let id = coordinator
            .remember_decision(DecisionInput::new("  Use WAL  ", "concurrent readers"))
            .unwrap();
        let recalled = coordinator.recall_decisions(Some("wal"), 0).unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].id, id);
        assert_eq!(recalled[0].decision, "Use WAL");
    }

    #[test]
    fn test_required_fields_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir);

        assert!(matches!(
            coordinator.remember_decision(DecisionInput::new("", "why")),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            coordinator.store_pattern(PatternInput::new("bad name", "d")),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            coordinator.set_context("a/b", "v"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rate_limited_and_exempt_operations() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let config = MemkeepConfig::new()
            .with_db_path(dir.path().join("memory.db"))
            .with_rate_limit(RateLimitConfig::default().with_max_ops(2));
        let coordinator = ResourceCoordinator::open_with_clock(config, clock.clone());

        coordinator.set_context("a", "1").unwrap();
        coordinator.get_context().unwrap();
        let err = coordinator.get_patterns().unwrap_err();
        assert!(matches!(err, Error::RateLimited { max_ops: 2, window_secs: 60 }));

        // Inspection operations do not consume budget.
        coordinator.memory_stats().unwrap();
        coordinator.export_memory().unwrap();
        coordinator.health_check().unwrap();
        assert_eq!(coordinator.rate_limit_status().remaining, 0);

        clock.advance(Duration::from_secs(61));
        coordinator.get_patterns().unwrap();
    }

    #[test]
    fn test_purge_flow() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir);
        coordinator.set_context("k", "v").unwrap();

        assert!(matches!(
            coordinator.purge_memory(Some("PURGE-NOPE")),
            Err(Error::TokenExpiredOrAbsent)
        ));

        let token = match coordinator.purge_memory(None).unwrap() {
            PurgeOutcome::ConfirmationRequired { token, expires_in } => {
                assert_eq!(expires_in, Duration::from_secs(60));
                token.expose_secret().to_string()
            },
            PurgeOutcome::Purged(_) => panic!("purge ran without confirmation"),
        };
        assert_eq!(coordinator.get_context().unwrap().len(), 1);

        assert!(matches!(
            coordinator.purge_memory(Some("PURGE-WRONG")),
            Err(Error::TokenMismatch { .. })
        ));

        match coordinator.purge_memory(Some(&token)).unwrap() {
            PurgeOutcome::Purged(report) => assert_eq!(report.context, 1),
            PurgeOutcome::ConfirmationRequired { .. } => panic!("token was not accepted"),
        }
        assert!(coordinator.get_context().unwrap().is_empty());
    }

    #[test]
    fn test_import_skips_invalid_records() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir);
        let json = r#"{"data": {
            "decisions": [{"decision": "d", "rationale": "r"}, {"decision": "no rationale"}],
            "patterns": [{"name": "ok", "description": "x"}, {"name": "bad name"}],
            "context": {"good": "v", "bad key": "v"}
        }}"#;

        let report = coordinator.import_memory(json, true).unwrap();
        assert_eq!(report.decisions, 1);
        assert_eq!(report.patterns, 1);
        assert_eq!(report.context, 1);
        assert_eq!(report.skipped, 3);
    }

    #[test]
    fn test_import_limits() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemkeepConfig::new().with_db_path(dir.path().join("memory.db"));
        config.import.max_json_bytes = 64;
        config.import.max_patterns = 1;
        let coordinator = ResourceCoordinator::open(config);

        let big = format!(r#"{{"data": {{"context": {{"k": "{}"}}}}}}"#, "v".repeat(100));
        assert!(matches!(coordinator.import_memory(&big, true), Err(Error::InvalidInput(_))));

        let many = r#"{"data": {"patterns": [{"name": "a"}, {"name": "b"}]}}"#;
        let err = coordinator.import_memory(many, true).unwrap_err();
        assert!(err.to_string().contains("patterns"));

        assert!(matches!(
            coordinator.import_memory("not json", true),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_health_degrades_near_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemkeepConfig::new()
            .with_db_path(dir.path().join("memory.db"))
            .with_capacity(CapacityLimits {
                max_decisions: 1000,
                max_patterns: 100,
                max_context_keys: 2,
            });
        let coordinator = ResourceCoordinator::open(config);

        let report = coordinator.health_check().unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(
            report.check("database_integrity").map(|c| c.detail.as_str()),
            Some("ok")
        );

        coordinator.set_context("a", "1").unwrap();
        coordinator.set_context("b", "2").unwrap();
        let report = coordinator.health_check().unwrap();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.check("capacity").map(|c| c.status), Some(HealthStatus::Degraded));
    }

    #[test]
    fn test_health_waits_for_one_connection_when_pool_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemkeepConfig::new()
            .with_db_path(dir.path().join("memory.db"))
            .with_pool(crate::storage::PoolConfig::new(1, 0, 1, Duration::from_millis(300)));
        let coordinator = ResourceCoordinator::open(config);
        let _held = coordinator.pool.acquire().unwrap();

        let started = std::time::Instant::now();
        let report = coordinator.health_check().unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(900), "health check took {elapsed:?}");
        assert_eq!(report.status, HealthStatus::Unhealthy);
        for component in ["database_connection", "database_integrity", "write_capability", "capacity"] {
            assert_eq!(
                report.check(component).map(|c| c.status),
                Some(HealthStatus::Unhealthy),
                "{component}"
            );
        }
    }

    #[test]
    fn test_store_failure_is_internal_with_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let config = MemkeepConfig::new().with_db_path(blocker.join("memory.db"));
        let coordinator = ResourceCoordinator::open(config);

        match coordinator.get_patterns() {
            Err(Error::Internal { request_id }) => assert_eq!(request_id.len(), 36),
            other => panic!("expected internal error, got {other:?}"),
        }
    }
}
