//! `SQLite` storage for decisions, patterns and context.
//!
//! Every write runs in a `BEGIN IMMEDIATE` transaction that applies capacity
//! eviction and the write together. Functions return [`rusqlite::Result`] so
//! callers can tell transient busy/locked errors from permanent ones.
//!
//! # Schema
//!
//! | Table | Key | Eviction order |
//! |-------|-----|----------------|
//! | `decisions` | `id` (autoincrement) | `id` ascending |
//! | `patterns` | `name` (unique) | `write_seq` ascending |
//! | `context` | `key` | `write_seq` ascending |
//!
//! `write_seq` is bumped on every insert or update, giving a strict
//! least-recently-updated order even when timestamps collide.

use super::bounded::{BoundedCollection, CapacityPolicy};
use super::sql::contains_pattern;
use crate::config::CapacityLimits;
use crate::models::{
    ContextEntry, Decision, DecisionId, DecisionInput, ExportData, ImportData, ImportReport,
    Pattern, PatternInput, PurgeReport,
};
use crate::{Error, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, Row, TransactionBehavior, params};
use tracing::instrument;

/// Key used by the write probe; never visible outside a rolled-back transaction.
const HEALTH_PROBE_KEY: &str = "_health_check";

/// Creates tables and indexes if they do not exist.
///
/// # Errors
///
/// Returns an error if the schema cannot be created.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS decisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            decision TEXT NOT NULL,
            rationale TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '',
            alternatives TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS patterns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            description TEXT NOT NULL,
            example TEXT NOT NULL DEFAULT '',
            when_to_use TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL,
            write_seq INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS context (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            write_seq INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_decisions_timestamp ON decisions(timestamp);
        CREATE INDEX IF NOT EXISTS idx_patterns_write_seq ON patterns(write_seq);
        CREATE INDEX IF NOT EXISTS idx_context_write_seq ON context(write_seq);",
    )
    .map_err(|e| Error::operation("initialize_schema", e))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<usize> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(usize::try_from(n).unwrap_or(0))
}

// ============================================================================
// Bounded tables
// ============================================================================

/// A decision ready to be written.
#[derive(Debug, Clone)]
pub struct NewDecision {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Content.
    pub input: DecisionInput,
}

/// The `decisions` table as an append-only bounded log.
pub struct DecisionLog<'c> {
    conn: &'c Connection,
    capacity: usize,
}

impl<'c> DecisionLog<'c> {
    /// Wraps a connection (normally an open transaction).
    #[must_use]
    pub const fn new(conn: &'c Connection, capacity: usize) -> Self {
        Self { conn, capacity }
    }
}

impl BoundedCollection for DecisionLog<'_> {
    type Entry = NewDecision;
    type Error = rusqlite::Error;

    fn policy(&self) -> CapacityPolicy {
        CapacityPolicy::AppendOnly
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> rusqlite::Result<usize> {
        count_rows(self.conn, "decisions")
    }

    fn adds_entry(&self, _entry: &NewDecision) -> rusqlite::Result<bool> {
        Ok(true)
    }

    fn evict(&mut self, count: usize) -> rusqlite::Result<usize> {
        let evicted = self.conn.execute(
            "DELETE FROM decisions WHERE id IN (
                SELECT id FROM decisions ORDER BY id ASC LIMIT ?1
            )",
            params![sql_count(count)],
        )?;
        tracing::info!(evicted, capacity = self.capacity, "Evicted oldest decisions");
        metrics::counter!("memory_evictions_total", "collection" => "decisions")
            .increment(evicted as u64);
        Ok(evicted)
    }

    fn write(&mut self, entry: NewDecision) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO decisions (timestamp, decision, rationale, context, alternatives)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.timestamp,
                entry.input.decision,
                entry.input.rationale,
                entry.input.context,
                entry.input.alternatives
            ],
        )?;
        Ok(())
    }
}

/// The `patterns` table as a keyed bounded map.
pub struct PatternTable<'c> {
    conn: &'c Connection,
    capacity: usize,
}

impl<'c> PatternTable<'c> {
    /// Wraps a connection (normally an open transaction).
    #[must_use]
    pub const fn new(conn: &'c Connection, capacity: usize) -> Self {
        Self { conn, capacity }
    }
}

impl BoundedCollection for PatternTable<'_> {
    type Entry = PatternInput;
    type Error = rusqlite::Error;

    fn policy(&self) -> CapacityPolicy {
        CapacityPolicy::Keyed
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> rusqlite::Result<usize> {
        count_rows(self.conn, "patterns")
    }

    fn adds_entry(&self, entry: &PatternInput) -> rusqlite::Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM patterns WHERE name = ?1)",
            params![entry.name],
            |row| row.get(0),
        )?;
        Ok(!exists)
    }

    fn evict(&mut self, count: usize) -> rusqlite::Result<usize> {
        let evicted = self.conn.execute(
            "DELETE FROM patterns WHERE id IN (
                SELECT id FROM patterns ORDER BY write_seq ASC, id ASC LIMIT ?1
            )",
            params![sql_count(count)],
        )?;
        tracing::info!(evicted, capacity = self.capacity, "Evicted least recently updated patterns");
        metrics::counter!("memory_evictions_total", "collection" => "patterns")
            .increment(evicted as u64);
        Ok(evicted)
    }

    fn write(&mut self, entry: PatternInput) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO patterns (name, description, example, when_to_use, updated_at, write_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, (SELECT COALESCE(MAX(write_seq), 0) + 1 FROM patterns))
             ON CONFLICT(name) DO UPDATE SET
                description = excluded.description,
                example = excluded.example,
                when_to_use = excluded.when_to_use,
                updated_at = excluded.updated_at,
                write_seq = excluded.write_seq",
            params![
                entry.name,
                entry.description,
                entry.example,
                entry.when_to_use,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }
}

/// The `context` table as a keyed bounded map.
pub struct ContextTable<'c> {
    conn: &'c Connection,
    capacity: usize,
}

impl<'c> ContextTable<'c> {
    /// Wraps a connection (normally an open transaction).
    #[must_use]
    pub const fn new(conn: &'c Connection, capacity: usize) -> Self {
        Self { conn, capacity }
    }
}

impl BoundedCollection for ContextTable<'_> {
    type Entry = (String, String);
    type Error = rusqlite::Error;

    fn policy(&self) -> CapacityPolicy {
        CapacityPolicy::Keyed
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> rusqlite::Result<usize> {
        count_rows(self.conn, "context")
    }

    fn adds_entry(&self, entry: &(String, String)) -> rusqlite::Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM context WHERE key = ?1)",
            params![entry.0],
            |row| row.get(0),
        )?;
        Ok(!exists)
    }

    fn evict(&mut self, count: usize) -> rusqlite::Result<usize> {
        let evicted = self.conn.execute(
            "DELETE FROM context WHERE key IN (
                SELECT key FROM context ORDER BY write_seq ASC, key ASC LIMIT ?1
            )",
            params![sql_count(count)],
        )?;
        tracing::info!(evicted, capacity = self.capacity, "Evicted least recently updated context keys");
        metrics::counter!("memory_evictions_total", "collection" => "context")
            .increment(evicted as u64);
        Ok(evicted)
    }

    fn write(&mut self, entry: (String, String)) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO context (key, value, updated_at, write_seq)
             VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(write_seq), 0) + 1 FROM context))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at,
                write_seq = excluded.write_seq",
            params![entry.0, entry.1, now_rfc3339()],
        )?;
        Ok(())
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Records a decision, evicting old ones first if the log is full.
///
/// Returns the new id and the number of evicted decisions.
#[instrument(skip(conn, input), fields(operation = "insert_decision"))]
pub fn insert_decision(
    conn: &mut Connection,
    input: &DecisionInput,
    capacity: usize,
) -> rusqlite::Result<(DecisionId, usize)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let evicted = DecisionLog::new(&tx, capacity).insert_or_update(NewDecision {
        timestamp: now_rfc3339(),
        input: input.clone(),
    })?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok((DecisionId::new(id), evicted))
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    Ok(Decision {
        id: DecisionId::new(row.get(0)?),
        timestamp: row.get(1)?,
        decision: row.get(2)?,
        rationale: row.get(3)?,
        context: row.get(4)?,
        alternatives: row.get(5)?,
    })
}

/// Returns the newest decisions, optionally filtered by a literal keyword.
#[instrument(skip(conn), fields(operation = "search_decisions"))]
pub fn search_decisions(
    conn: &Connection,
    keyword: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<Decision>> {
    let limit = sql_count(limit);
    match keyword.filter(|k| !k.is_empty()) {
        Some(keyword) => {
            let pattern = contains_pattern(keyword);
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, decision, rationale, context, alternatives
                 FROM decisions
                 WHERE decision LIKE ?1 ESCAPE '\\'
                    OR rationale LIKE ?1 ESCAPE '\\'
                    OR context LIKE ?1 ESCAPE '\\'
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![pattern, limit], decision_from_row)?;
            rows.collect()
        },
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, decision, rationale, context, alternatives
                 FROM decisions ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], decision_from_row)?;
            rows.collect()
        },
    }
}

/// Inserts or updates a pattern; returns the number of evicted patterns.
#[instrument(skip(conn, input), fields(operation = "upsert_pattern", pattern.name = %input.name))]
pub fn upsert_pattern(
    conn: &mut Connection,
    input: &PatternInput,
    capacity: usize,
) -> rusqlite::Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let evicted = PatternTable::new(&tx, capacity).insert_or_update(input.clone())?;
    tx.commit()?;
    Ok(evicted)
}

/// Returns all patterns ordered by name.
pub fn list_patterns(conn: &Connection) -> rusqlite::Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(
        "SELECT name, description, example, when_to_use, updated_at
         FROM patterns ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Pattern {
            name: row.get(0)?,
            description: row.get(1)?,
            example: row.get(2)?,
            when_to_use: row.get(3)?,
            updated_at: row.get(4)?,
        })
    })?;
    rows.collect()
}

/// Sets a context value; returns the number of evicted keys.
#[instrument(skip(conn, value), fields(operation = "upsert_context", context.key = %key))]
pub fn upsert_context(
    conn: &mut Connection,
    key: &str,
    value: &str,
    capacity: usize,
) -> rusqlite::Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let evicted =
        ContextTable::new(&tx, capacity).insert_or_update((key.to_string(), value.to_string()))?;
    tx.commit()?;
    Ok(evicted)
}

/// Returns all context entries ordered by key.
pub fn list_context(conn: &Connection) -> rusqlite::Result<Vec<ContextEntry>> {
    let mut stmt = conn.prepare("SELECT key, value, updated_at FROM context ORDER BY key")?;
    let rows = stmt.query_map([], |row| {
        Ok(ContextEntry {
            key: row.get(0)?,
            value: row.get(1)?,
            updated_at: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Row counts as `(decisions, patterns, context)`.
pub fn counts(conn: &Connection) -> rusqlite::Result<(usize, usize, usize)> {
    Ok((
        count_rows(conn, "decisions")?,
        count_rows(conn, "patterns")?,
        count_rows(conn, "context")?,
    ))
}

/// Reads every record for export, decisions oldest first.
pub fn export_data(conn: &Connection) -> rusqlite::Result<ExportData> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, decision, rationale, context, alternatives
         FROM decisions ORDER BY id ASC",
    )?;
    let decisions = stmt
        .query_map([], decision_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let patterns = list_patterns(conn)?;
    let context = list_context(conn)?
        .into_iter()
        .map(|entry| (entry.key, entry.value))
        .collect();

    Ok(ExportData {
        decisions,
        patterns,
        context,
    })
}

/// Writes already-validated import records in one transaction.
///
/// With `merge == false` all collections are cleared first. Capacity is
/// enforced once after the bulk write. `skipped` in the report is left at 0.
#[instrument(skip(conn, data, limits), fields(operation = "import"))]
pub fn import_data(
    conn: &mut Connection,
    data: &ImportData,
    merge: bool,
    limits: &CapacityLimits,
) -> rusqlite::Result<ImportReport> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if !merge {
        tx.execute_batch("DELETE FROM decisions; DELETE FROM patterns; DELETE FROM context;")?;
    }

    let mut report = ImportReport::default();

    let mut decisions = DecisionLog::new(&tx, limits.max_decisions);
    for record in &data.decisions {
        decisions.write(NewDecision {
            timestamp: record.timestamp.clone().unwrap_or_else(now_rfc3339),
            input: DecisionInput {
                decision: record.decision.clone(),
                rationale: record.rationale.clone(),
                context: record.context.clone(),
                alternatives: record.alternatives.clone(),
            },
        })?;
        report.decisions += 1;
    }
    report.evicted += decisions.trim_to_capacity()?;

    let mut patterns = PatternTable::new(&tx, limits.max_patterns);
    for record in &data.patterns {
        patterns.write(PatternInput {
            name: record.name.clone(),
            description: record.description.clone(),
            example: record.example.clone(),
            when_to_use: record.when_to_use.clone(),
        })?;
        report.patterns += 1;
    }
    report.evicted += patterns.trim_to_capacity()?;

    let mut context = ContextTable::new(&tx, limits.max_context_keys);
    for (key, value) in &data.context {
        context.write((key.clone(), value.clone()))?;
        report.context += 1;
    }
    report.evicted += context.trim_to_capacity()?;

    tx.commit()?;
    Ok(report)
}

/// Deletes every record and compacts the file.
#[instrument(skip(conn), fields(operation = "purge"))]
pub fn purge_all(conn: &mut Connection) -> rusqlite::Result<PurgeReport> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let (decisions, patterns, context) = counts(&tx)?;
    tx.execute_batch("DELETE FROM decisions; DELETE FROM patterns; DELETE FROM context;")?;
    tx.commit()?;

    if let Err(e) = conn.execute_batch("VACUUM") {
        tracing::warn!(error = %e, "VACUUM after purge failed");
    }

    Ok(PurgeReport {
        decisions,
        patterns,
        context,
    })
}

/// Runs `SELECT 1`.
pub fn ping(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

/// Returns the first line of `PRAGMA integrity_check` (`"ok"` when healthy).
pub fn integrity_check(conn: &Connection) -> rusqlite::Result<String> {
    conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))
}

/// Inserts and deletes a probe row in a transaction that is rolled back.
pub fn probe_write(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO context (key, value, updated_at) VALUES (?1, 'probe', ?2)",
        params![HEALTH_PROBE_KEY, now_rfc3339()],
    )?;
    tx.execute("DELETE FROM context WHERE key = ?1", params![HEALTH_PROBE_KEY])?;
    tx.rollback()
}
