//! Capacity and import limits.

use super::env::{EnvLookup, parse_usize};
use serde::{Deserialize, Serialize};

/// Per-entity capacity limits for the bounded collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLimits {
    /// Maximum stored decisions (append-only log).
    pub max_decisions: usize,
    /// Maximum stored patterns (keyed).
    pub max_patterns: usize,
    /// Maximum stored context keys (keyed).
    pub max_context_keys: usize,
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self {
            max_decisions: 1000,
            max_patterns: 100,
            max_context_keys: 50,
        }
    }
}

impl CapacityLimits {
    /// Applies overrides.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `MEMKEEP_MAX_DECISIONS` | 1000 |
    /// | `MEMKEEP_MAX_PATTERNS` | 100 |
    /// | `MEMKEEP_MAX_CONTEXT_KEYS` | 50 |
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvLookup<'_>) -> Self {
        if let Some(n) = parse_usize(env, "MEMKEEP_MAX_DECISIONS") {
            self.max_decisions = n.max(1);
        }
        if let Some(n) = parse_usize(env, "MEMKEEP_MAX_PATTERNS") {
            self.max_patterns = n.max(1);
        }
        if let Some(n) = parse_usize(env, "MEMKEEP_MAX_CONTEXT_KEYS") {
            self.max_context_keys = n.max(1);
        }
        self
    }
}

/// Limits applied to import payloads before and after parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportLimits {
    /// Maximum raw JSON size in bytes, checked before parsing.
    pub max_json_bytes: usize,
    /// Maximum decisions in one import.
    pub max_decisions: usize,
    /// Maximum patterns in one import.
    pub max_patterns: usize,
    /// Maximum context keys in one import.
    pub max_context_keys: usize,
}

impl Default for ImportLimits {
    fn default() -> Self {
        Self {
            max_json_bytes: 10 * 1024 * 1024,
            max_decisions: 10_000,
            max_patterns: 1_000,
            max_context_keys: 500,
        }
    }
}

impl ImportLimits {
    /// Applies `MEMKEEP_MAX_IMPORT_*` overrides.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvLookup<'_>) -> Self {
        if let Some(n) = parse_usize(env, "MEMKEEP_MAX_IMPORT_JSON_SIZE") {
            self.max_json_bytes = n;
        }
        if let Some(n) = parse_usize(env, "MEMKEEP_MAX_IMPORT_DECISIONS") {
            self.max_decisions = n;
        }
        if let Some(n) = parse_usize(env, "MEMKEEP_MAX_IMPORT_PATTERNS") {
            self.max_patterns = n;
        }
        if let Some(n) = parse_usize(env, "MEMKEEP_MAX_IMPORT_CONTEXT_KEYS") {
            self.max_context_keys = n;
        }
        self
    }
}
