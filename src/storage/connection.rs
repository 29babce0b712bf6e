//! `SQLite` connection handling.
//!
//! Opens and configures store handles for the pool, and provides the
//! poison-recovering lock helper shared by every component that guards state
//! with a `std::sync::Mutex`.

use super::memory_store::initialize_schema;
use super::pool::ConnectionFactory;
use crate::{Error, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Busy timeout applied to every handle, in milliseconds.
pub const BUSY_TIMEOUT_MS: u32 = 5000;

/// Helper to acquire mutex lock with poison recovery.
///
/// If the mutex is poisoned (a previous holder panicked), the inner value is
/// recovered and the event is logged and counted instead of cascading the
/// panic into every later caller.
pub fn acquire_lock<'a, T>(mutex: &'a Mutex<T>, lock_name: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(lock = lock_name, "Mutex was poisoned, recovering");
            metrics::counter!("mutex_poison_recovery_total", "lock" => lock_name).increment(1);
            poisoned.into_inner()
        },
    }
}

/// Configures a `SQLite` connection for concurrent use.
///
/// - **WAL mode**: concurrent readers with a single writer
/// - **NORMAL synchronous**: balances durability with performance
/// - **`busy_timeout`**: waits for locks instead of failing immediately
/// - **`foreign_keys`**: on
///
/// # Errors
///
/// Currently infallible; pragma results are ignored because `journal_mode`
/// returns a row and in-memory databases cannot switch to WAL.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS);
    let _ = conn.pragma_update(None, "foreign_keys", "ON");

    Ok(())
}

/// Opens a configured connection to the database at `path`.
///
/// Parent directories are created when missing.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the database cannot
/// be opened.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::operation("create_db_dir", format!("{}: {e}", parent.display()))
        })?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    let conn = Connection::open_with_flags(path, flags)
        .map_err(|e| Error::operation("open_database", format!("{}: {e}", path.display())))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Opens store handles for the connection pool.
///
/// The schema is created by the first successful connect.
#[derive(Debug)]
pub struct SqliteConnectionFactory {
    path: PathBuf,
    schema_ready: AtomicBool,
}

impl SqliteConnectionFactory {
    /// Creates a factory for the database at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_ready: AtomicBool::new(false),
        }
    }

    /// Returns the database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionFactory for SqliteConnectionFactory {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection> {
        let conn = open_connection(&self.path)?;
        if !self.schema_ready.load(Ordering::Acquire) {
            initialize_schema(&conn)?;
            self.schema_ready.store(true, Ordering::Release);
        }
        metrics::counter!("sqlite_connections_opened_total").increment(1);
        Ok(conn)
    }

    fn is_alive(&self, conn: &Connection) -> bool {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok_and(|value| value == 1)
    }
}
