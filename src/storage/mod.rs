//! Storage layer.
//!
//! - **Pool**: bounded connection pool with temporary overflow and a wait queue
//! - **Connection**: `SQLite` handle setup and the pool's connection factory
//! - **Memory store**: decisions, patterns and context with capacity eviction
//! - **Rate log**: durable admission timestamps for the rate limiter
//! - **Resilience**: retry of busy/locked store errors

// Allow significant_drop_tightening - holding a pooled handle for the whole
// operation is intended.
#![allow(clippy::significant_drop_tightening)]
// Allow cast_possible_truncation / cast_sign_loss for row counts and metrics.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod bounded;
pub mod connection;
pub mod memory_store;
pub mod pool;
pub mod rate_log;
pub mod resilience;
pub mod sql;

pub use bounded::{BoundedCollection, BoundedLog, BoundedMap, CapacityPolicy, eviction_count};
pub use connection::{SqliteConnectionFactory, acquire_lock, open_connection};
pub use pool::{
    ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection, Provenance,
};
pub use rate_log::{RateLog, SqliteRateLog};
pub use resilience::{RetryPolicy, is_transient, retry_transient};
pub use sql::escape_like_wildcards;
