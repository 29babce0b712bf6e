//! Stored memory records: decisions, patterns and context entries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a stored decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionId(i64);

impl DecisionId {
    /// Creates a decision ID from its row id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw row id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for DecisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A recorded decision with its rationale.
///
/// Decisions form an append-only log; the oldest are evicted first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Row id, increasing with insertion order.
    pub id: DecisionId,
    /// RFC 3339 timestamp of when the decision was recorded.
    pub timestamp: String,
    /// What was decided.
    pub decision: String,
    /// Why.
    pub rationale: String,
    /// Surrounding context.
    #[serde(default)]
    pub context: String,
    /// Alternatives that were considered.
    #[serde(default)]
    pub alternatives: String,
}

/// Input for recording a decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionInput {
    /// What was decided.
    pub decision: String,
    /// Why.
    pub rationale: String,
    /// Surrounding context.
    pub context: String,
    /// Alternatives that were considered.
    pub alternatives: String,
}

impl DecisionInput {
    /// Creates an input with the two required fields.
    #[must_use]
    pub fn new(decision: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            rationale: rationale.into(),
            ..Self::default()
        }
    }

    /// Sets the context.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Sets the considered alternatives.
    #[must_use]
    pub fn with_alternatives(mut self, alternatives: impl Into<String>) -> Self {
        self.alternatives = alternatives.into();
        self
    }
}

/// A named, reusable pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique name.
    pub name: String,
    /// What the pattern is.
    pub description: String,
    /// Example usage.
    #[serde(default)]
    pub example: String,
    /// When to apply it.
    #[serde(default)]
    pub when_to_use: String,
    /// RFC 3339 timestamp of the last write.
    #[serde(default)]
    pub updated_at: String,
}

/// Input for storing a pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternInput {
    /// Unique name; must be a valid key.
    pub name: String,
    /// What the pattern is.
    pub description: String,
    /// Example usage.
    pub example: String,
    /// When to apply it.
    pub when_to_use: String,
}

impl PatternInput {
    /// Creates an input with the two required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Sets the example.
    #[must_use]
    pub fn with_example(mut self, example: impl Into<String>) -> Self {
        self.example = example.into();
        self
    }

    /// Sets when to use the pattern.
    #[must_use]
    pub fn with_when_to_use(mut self, when_to_use: impl Into<String>) -> Self {
        self.when_to_use = when_to_use.into();
        self
    }
}

/// A key/value context entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Key; must be a valid key.
    pub key: String,
    /// Value.
    pub value: String,
    /// RFC 3339 timestamp of the last write.
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_builders() {
        let input = DecisionInput::new("Use WAL", "Readers never block")
            .with_context("storage")
            .with_alternatives("rollback journal");
        assert_eq!(input.decision, "Use WAL");
        assert_eq!(input.context, "storage");
        assert_eq!(input.alternatives, "rollback journal");

        let pattern = PatternInput::new("retry-busy", "Retry busy writes").with_example("3x");
        assert_eq!(pattern.example, "3x");
        assert!(pattern.when_to_use.is_empty());
    }

    #[test]
    fn test_decision_id_serializes_as_number() {
        let json = serde_json::to_string(&DecisionId::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
