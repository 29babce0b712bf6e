//! Integration tests for the resource coordinator.
//!
//! Exercises the full path against a real `SQLite` file:
//! - Pool backpressure with temporary overflow and a bounded queue
//! - Durable rate limiting across restarts
//! - Capacity eviction through the public operations
//! - Export and import between two databases

// Integration tests use expect/unwrap/panic for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use memkeep::storage::{ConnectionPool, PoolConfig, SqliteConnectionFactory};
use memkeep::{
    DecisionInput, Error, ExhaustionReason, ManualClock, MemkeepConfig, PatternInput,
    PurgeOutcome, RateLimitConfig, ResourceCoordinator,
};
use memkeep::config::CapacityLimits;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(dir: &TempDir) -> MemkeepConfig {
    MemkeepConfig::new().with_db_path(dir.path().join("memory.db"))
}

// ============================================================================
// Pool backpressure
// ============================================================================

#[test]
fn test_pool_overflow_queue_and_timeout_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let factory = SqliteConnectionFactory::new(dir.path().join("pool.db"));
    let pool = Arc::new(ConnectionPool::new(
        factory,
        PoolConfig::new(2, 1, 1, Duration::from_secs(1)),
    ));

    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    let overflow = pool.acquire().unwrap();
    assert!(!first.is_temporary());
    assert!(!second.is_temporary());
    assert!(overflow.is_temporary());

    // The fourth caller queues and times out.
    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let start = Instant::now();
            let result = pool.acquire().map(|_| ());
            (result, start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(200));

    // The queue holds one; a fifth caller is rejected immediately.
    match pool.acquire() {
        Err(Error::ResourceExhausted { reason, .. }) => assert_eq!(reason, ExhaustionReason::QueueFull),
        other => panic!("expected queue full, got {other:?}"),
    }

    let (result, waited) = waiter.join().unwrap();
    match result {
        Err(Error::ResourceExhausted { reason, .. }) => {
            assert_eq!(reason, ExhaustionReason::WaitTimeout);
        },
        other => panic!("expected wait timeout, got {other:?}"),
    }
    assert!(waited >= Duration::from_millis(900));

    // Exhaustion counts temporary overflow, not rejections.
    let stats = pool.stats();
    assert_eq!(stats.exhaustion_count, 1);
    assert_eq!(stats.temp_created_total, 1);
    assert_eq!(stats.temp_active, 1);

    drop((first, second, overflow));
    let stats = pool.stats();
    assert_eq!(stats.available, 2);
    assert_eq!(stats.temp_active, 0);
}

#[test]
fn test_queued_caller_gets_released_handle() {
    let dir = TempDir::new().unwrap();
    let factory = SqliteConnectionFactory::new(dir.path().join("pool.db"));
    let pool = Arc::new(ConnectionPool::new(
        factory,
        PoolConfig::new(1, 0, 4, Duration::from_secs(5)),
    ));

    let held = pool.acquire().unwrap();
    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let conn = pool.acquire().unwrap();
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).unwrap()
        })
    };
    thread::sleep(Duration::from_millis(100));
    drop(held);

    assert_eq!(waiter.join().unwrap(), 1);
}

// ============================================================================
// Durable rate limiting
// ============================================================================

#[test]
fn test_durable_rate_limit_survives_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let limited = config(&dir).with_rate_limit(
        RateLimitConfig::default()
            .with_max_ops(3)
            .with_persist(true),
    );

    {
        let coordinator = ResourceCoordinator::open_with_clock(limited.clone(), clock.clone());
        assert!(coordinator.rate_limit_status().durable);
        coordinator.set_context("one", "1").unwrap();
        coordinator.set_context("two", "2").unwrap();
        coordinator.close();
    }

    clock.advance(Duration::from_secs(10));
    let coordinator = ResourceCoordinator::open_with_clock(limited, clock.clone());
    assert_eq!(coordinator.rate_limit_status().remaining, 1);
    coordinator.set_context("three", "3").unwrap();
    assert!(matches!(
        coordinator.set_context("four", "4"),
        Err(Error::RateLimited { max_ops: 3, .. })
    ));

    clock.advance(Duration::from_secs(61));
    coordinator.set_context("four", "4").unwrap();
}

#[test]
fn test_rate_limit_reconfigure_at_runtime() {
    let dir = TempDir::new().unwrap();
    let coordinator = ResourceCoordinator::open(config(&dir));

    coordinator.get_patterns().unwrap();
    coordinator.get_patterns().unwrap();
    let status = coordinator.configure_rate_limit(Some(2), None).unwrap();
    assert_eq!(status.remaining, 0);
    assert!(coordinator.get_patterns().is_err());

    assert!(matches!(
        coordinator.configure_rate_limit(Some(0), None),
        Err(Error::InvalidInput(_))
    ));

    coordinator.reset_rate_limit();
    coordinator.get_patterns().unwrap();
}

// ============================================================================
// Capacity
// ============================================================================

#[test]
fn test_decision_capacity_is_enforced() {
    let dir = TempDir::new().unwrap();
    let coordinator = ResourceCoordinator::open(config(&dir).with_capacity(CapacityLimits {
        max_decisions: 20,
        max_patterns: 3,
        max_context_keys: 3,
    }));

    for n in 0..45 {
        coordinator
            .remember_decision(DecisionInput::new(format!("decision {n}"), "because"))
            .unwrap();
        assert!(coordinator.memory_stats().unwrap().decisions <= 20);
    }

    let newest = coordinator.recall_decisions(None, 1).unwrap();
    assert_eq!(newest[0].decision, "decision 44");
}

#[test]
fn test_pattern_updates_refresh_recency() {
    let dir = TempDir::new().unwrap();
    let coordinator = ResourceCoordinator::open(config(&dir).with_capacity(CapacityLimits {
        max_decisions: 10,
        max_patterns: 2,
        max_context_keys: 2,
    }));

    coordinator.store_pattern(PatternInput::new("builder", "v1")).unwrap();
    coordinator.store_pattern(PatternInput::new("newtype", "v1")).unwrap();
    coordinator.store_pattern(PatternInput::new("builder", "v2")).unwrap();
    coordinator.store_pattern(PatternInput::new("raii", "v1")).unwrap();

    let names: Vec<_> = coordinator
        .get_patterns()
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["builder", "raii"]);
}

// ============================================================================
// Export / import / purge
// ============================================================================

#[test]
fn test_export_then_replace_import_into_fresh_store() {
    let source_dir = TempDir::new().unwrap();
    let source = ResourceCoordinator::open(config(&source_dir));
    source
        .remember_decision(
            DecisionInput::new("Use WAL", "readers never block").with_alternatives("rollback journal"),
        )
        .unwrap();
    source
        .store_pattern(PatternInput::new("retry", "backoff on busy").with_when_to_use("writes"))
        .unwrap();
    source.set_context("language", "rust").unwrap();

    let document = source.export_memory().unwrap();
    assert_eq!(document.stats.decisions, 1);
    let json = serde_json::to_string(&document).unwrap();

    let target_dir = TempDir::new().unwrap();
    let target = ResourceCoordinator::open(config(&target_dir));
    target.set_context("stale", "x").unwrap();

    let report = target.import_memory(&json, false).unwrap();
    assert_eq!((report.decisions, report.patterns, report.context), (1, 1, 1));
    assert_eq!(report.skipped, 0);

    let decisions = target.recall_decisions(Some("WAL"), 10).unwrap();
    assert_eq!(decisions[0].alternatives, "rollback journal");
    assert_eq!(decisions[0].timestamp, document.data.decisions[0].timestamp);
    let context = target.get_context().unwrap();
    assert_eq!(context.get("language").map(String::as_str), Some("rust"));
    assert!(!context.contains_key("stale"));
}

#[test]
fn test_purge_token_expires() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let coordinator = ResourceCoordinator::open_with_clock(
        config(&dir).with_purge_token_ttl(Duration::from_secs(5)),
        clock.clone(),
    );
    coordinator.set_context("keep", "me").unwrap();

    let PurgeOutcome::ConfirmationRequired { token, .. } = coordinator.purge_memory(None).unwrap()
    else {
        panic!("expected a confirmation token");
    };
    clock.advance(Duration::from_secs(6));

    assert!(matches!(
        coordinator.purge_memory(Some(token.expose_secret())),
        Err(Error::TokenExpiredOrAbsent)
    ));
    assert_eq!(coordinator.get_context().unwrap().len(), 1);
}

#[test]
fn test_mismatch_error_never_reveals_pending_token() {
    let dir = TempDir::new().unwrap();
    let coordinator = ResourceCoordinator::open(config(&dir));

    let outcome = coordinator.purge_memory(None).unwrap();
    let token = outcome.token().unwrap().to_string();
    let err = coordinator.purge_memory(Some("PURGE-0000")).unwrap_err();

    assert_eq!(err.code(), "TOKEN_MISMATCH");
    assert!(!format!("{err} {err:?}").contains(&token));
}

#[test]
fn test_health_reports_all_probes() {
    let dir = TempDir::new().unwrap();
    let coordinator = ResourceCoordinator::open(config(&dir));

    let report = coordinator.health_check().unwrap();
    for name in [
        "database_connection",
        "database_integrity",
        "write_capability",
        "capacity",
        "connection_pool",
        "rate_limiter",
    ] {
        assert!(report.check(name).is_some(), "missing probe {name}");
    }
    assert_eq!(report.status, memkeep::HealthStatus::Healthy);
    assert!(report.pool.initialized);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "healthy");
}

#[test]
fn test_closed_coordinator_rejects_store_operations() {
    let dir = TempDir::new().unwrap();
    let coordinator = ResourceCoordinator::open(config(&dir));
    coordinator.get_patterns().unwrap();
    coordinator.close();

    assert!(matches!(
        coordinator.get_patterns(),
        Err(Error::ResourceExhausted {
            reason: ExhaustionReason::Closed,
            ..
        })
    ));
}
