//! Durable log of admitted operations for the rate limiter.

use super::connection::{acquire_lock, open_connection};
use crate::{Error, Result};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistent record of admission timestamps.
///
/// The limiter's in-memory window stays authoritative; the log only seeds it
/// on startup.
pub trait RateLog: Send + Sync {
    /// Deletes entries older than `since_ms` and returns the rest, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    fn load(&self, since_ms: u64) -> Result<Vec<u64>>;

    /// Records one admission.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    fn append(&self, timestamp_ms: u64) -> Result<()>;

    /// Deletes entries older than `before_ms`; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    fn cleanup(&self, before_ms: u64) -> Result<usize>;

    /// Deletes every entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    fn clear(&self) -> Result<()>;
}

/// `SQLite`-backed [`RateLog`] on its own connection.
///
/// Uses the `rate_limit_ops` table, normally in the same file as the memory
/// collections.
pub struct SqliteRateLog {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteRateLog {
    /// Opens (and creates if needed) the log in the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the table created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = open_connection(path)?;
        let log = Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        };
        log.initialize()?;
        Ok(log)
    }

    /// Creates an in-memory log (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::operation("open_rate_log", e))?;
        let log = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        log.initialize()?;
        Ok(log)
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn, "rate_log");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rate_limit_ops (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rate_limit_timestamp ON rate_limit_ops(timestamp);",
        )
        .map_err(|e| Error::operation("create_rate_limit_table", e))
    }
}

fn to_sql_millis(millis: u64) -> i64 {
    i64::try_from(millis).unwrap_or(i64::MAX)
}

impl RateLog for SqliteRateLog {
    fn load(&self, since_ms: u64) -> Result<Vec<u64>> {
        let conn = acquire_lock(&self.conn, "rate_log");
        let since = to_sql_millis(since_ms);

        conn.execute(
            "DELETE FROM rate_limit_ops WHERE timestamp < ?1",
            params![since],
        )
        .map_err(|e| Error::operation("trim_rate_log", e))?;

        let mut stmt = conn
            .prepare("SELECT timestamp FROM rate_limit_ops WHERE timestamp >= ?1 ORDER BY timestamp ASC")
            .map_err(|e| Error::operation("prepare_load_rate_log", e))?;
        let rows = stmt
            .query_map(params![since], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::operation("load_rate_log", e))?;

        let mut timestamps = Vec::new();
        for row in rows {
            let ts = row.map_err(|e| Error::operation("load_rate_log", e))?;
            timestamps.push(u64::try_from(ts).unwrap_or(0));
        }
        Ok(timestamps)
    }

    fn append(&self, timestamp_ms: u64) -> Result<()> {
        let conn = acquire_lock(&self.conn, "rate_log");
        conn.execute(
            "INSERT INTO rate_limit_ops (timestamp) VALUES (?1)",
            params![to_sql_millis(timestamp_ms)],
        )
        .map_err(|e| Error::operation("append_rate_log", e))?;
        Ok(())
    }

    fn cleanup(&self, before_ms: u64) -> Result<usize> {
        let conn = acquire_lock(&self.conn, "rate_log");
        conn.execute(
            "DELETE FROM rate_limit_ops WHERE timestamp < ?1",
            params![to_sql_millis(before_ms)],
        )
        .map_err(|e| Error::operation("cleanup_rate_log", e))
    }

    fn clear(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn, "rate_log");
        conn.execute("DELETE FROM rate_limit_ops", [])
            .map_err(|e| Error::operation("clear_rate_log", e))?;
        Ok(())
    }
}
