//! Property-based tests for resource bounds.
//!
//! Uses proptest to verify invariants across random inputs:
//! - Bounded collections never exceed capacity
//! - Keyed updates never evict
//! - Admitted operations in any window never exceed the limit
//! - Sanitized input is trimmed, NUL-free and bounded
//! - Escaped LIKE patterns match literally

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use memkeep::services::validation::{MAX_KEY_CHARS, MAX_TEXT_CHARS, TRUNCATION_MARKER};
use memkeep::services::{sanitize_input, validate_key};
use memkeep::storage::sql::contains_pattern;
use memkeep::storage::{BoundedCollection, BoundedLog, BoundedMap, CapacityPolicy, eviction_count};
use memkeep::{ManualClock, RateLimitConfig, RateLimiter};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Bounded collections
// ============================================================================

proptest! {
    /// Property: an append-only log never holds more than its capacity.
    #[test]
    fn prop_log_size_bounded(capacity in 1usize..200, inserts in 0usize..600) {
        let mut log = BoundedLog::new(capacity);
        for i in 0..inserts {
            log.insert_or_update(i).unwrap();
            prop_assert!(log.size() <= capacity);
            prop_assert_eq!(log.iter().last(), Some(&i));
        }
    }

    /// Property: a keyed map never exceeds capacity and keeps the latest write.
    #[test]
    fn prop_map_size_bounded(
        capacity in 1usize..20,
        keys in prop::collection::vec(0u8..40, 0..200),
    ) {
        let mut map = BoundedMap::new(capacity);
        for (n, key) in keys.into_iter().enumerate() {
            let existed = map.get(&key).is_some();
            let evicted = map.insert_or_update((key, n)).unwrap();
            prop_assert!(map.size() <= capacity);
            prop_assert_eq!(map.get(&key), Some(&n));
            if existed {
                prop_assert_eq!(evicted, 0);
            }
        }
    }

    /// Property: eviction always leaves room for exactly the new entry.
    #[test]
    fn prop_eviction_leaves_room(
        keyed in any::<bool>(),
        capacity in 1usize..5000,
        len in 0usize..10_000,
        adds in any::<bool>(),
    ) {
        let policy = if keyed { CapacityPolicy::Keyed } else { CapacityPolicy::AppendOnly };
        let count = eviction_count(policy, capacity, len, adds);
        prop_assert!(count <= len);
        if adds {
            prop_assert!(len - count < capacity);
        } else {
            prop_assert_eq!(count, 0);
        }
        if keyed && adds && len == capacity {
            prop_assert_eq!(count, 1);
        }
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

proptest! {
    /// Property: within any window of `window` length, admissions <= `max_ops`.
    #[test]
    fn prop_sliding_window_never_over_admits(
        max_ops in 1usize..20,
        window_secs in 1u64..10,
        gaps_ms in prop::collection::vec(0u64..2_000, 1..300),
    ) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = RateLimitConfig::default()
            .with_max_ops(max_ops)
            .with_window(Duration::from_secs(window_secs));
        let limiter = RateLimiter::new(&config, clock.clone());
        let window_ms = window_secs * 1000;

        let mut now = 1_000_000u64;
        let mut admitted: Vec<u64> = Vec::new();
        for gap in gaps_ms {
            now += gap;
            clock.set(now);
            if limiter.check() {
                admitted.push(now);
            }
        }

        for (i, &t) in admitted.iter().enumerate() {
            let in_window = admitted[..=i]
                .iter()
                .filter(|&&s| s >= t.saturating_sub(window_ms))
                .count();
            prop_assert!(in_window <= max_ops, "{in_window} admitted in window ending {t}");
        }
    }

    /// Property: after a full window of silence the whole budget is available.
    #[test]
    fn prop_budget_recovers_after_window(max_ops in 1usize..50, used in 0usize..100) {
        let clock = Arc::new(ManualClock::new(0));
        let config = RateLimitConfig::default().with_max_ops(max_ops);
        let limiter = RateLimiter::new(&config, clock.clone());
        for _ in 0..used {
            limiter.check();
        }
        prop_assert_eq!(limiter.remaining(), max_ops.saturating_sub(used));
        clock.advance(Duration::from_secs(61));
        prop_assert_eq!(limiter.remaining(), max_ops);
    }
}

// ============================================================================
// Input handling
// ============================================================================

proptest! {
    /// Property: sanitized text is trimmed, NUL-free and length-bounded.
    #[test]
    fn prop_sanitize_bounds(s in "\\PC{0,200}|[ \\x00a-z]{0,50}") {
        let out = sanitize_input(&s);
        prop_assert!(!out.contains('\0'));
        prop_assert_eq!(out.trim(), out.as_str());
        prop_assert!(out.chars().count() <= MAX_TEXT_CHARS + TRUNCATION_MARKER.len());
        prop_assert_eq!(sanitize_input(&out), out.clone());
    }

    /// Property: generated keys of the allowed alphabet are valid.
    #[test]
    fn prop_valid_keys_accepted(key in "[A-Za-z0-9_.-]{1,100}") {
        prop_assert!(validate_key(&key));
    }

    /// Property: keys with separators or whitespace are rejected.
    #[test]
    fn prop_invalid_keys_rejected(
        prefix in "[a-z]{0,10}",
        bad in prop::sample::select(vec![' ', '/', ';', '\'', '"', '%', '\n']),
        suffix in "[a-z]{0,10}",
    ) {
        let key = format!("{prefix}{bad}{suffix}");
        prop_assert!(!validate_key(&key));
    }

    /// Property: overlong keys are rejected.
    #[test]
    fn prop_long_keys_rejected(extra in 1usize..50) {
        prop_assert!(!validate_key(&"k".repeat(MAX_KEY_CHARS + extra)));
    }

    /// Property: an escaped needle matches the text it was taken from, literally.
    #[test]
    fn prop_like_pattern_matches_literally(
        before in "[a-z ]{0,10}",
        needle in "[a-z%_\\\\]{1,10}",
        after in "[a-z ]{0,10}",
    ) {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let haystack = format!("{before}{needle}{after}");
        let matched: bool = conn
            .query_row(
                "SELECT ?1 LIKE ?2 ESCAPE '\\'",
                rusqlite::params![haystack, contains_pattern(&needle)],
                |row| row.get(0),
            )
            .unwrap();
        prop_assert!(matched);

        // The same pattern never matches text where the wildcard chars were replaced.
        if needle.contains(['%', '_']) {
            let altered = needle.replace(['%', '_'], "x");
            let matched: bool = conn
                .query_row(
                    "SELECT ?1 LIKE ?2 ESCAPE '\\'",
                    rusqlite::params![altered, contains_pattern(&needle)],
                    |row| row.get(0),
                )
                .unwrap();
            prop_assert!(!matched);
        }
    }
}
