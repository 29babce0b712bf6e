//! Export and import documents.
//!
//! Exports carry full records; imports accept the same shape but every record
//! field is optional so partially hand-written documents still load.

use super::{Decision, MemoryStats, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full dump of the stored collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    /// Crate version that produced the export.
    pub version: String,
    /// RFC 3339 export time.
    pub exported_at: String,
    /// Project name the database belongs to.
    pub project: String,
    /// Stored records.
    pub data: ExportData,
    /// Statistics at export time.
    pub stats: MemoryStats,
}

/// Records in an export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportData {
    /// Decisions, oldest first.
    pub decisions: Vec<Decision>,
    /// Patterns, by name.
    pub patterns: Vec<Pattern>,
    /// Context entries.
    pub context: BTreeMap<String, String>,
}

/// Document accepted by import.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportDocument {
    /// Records to import.
    pub data: ImportData,
}

/// Records in an import document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportData {
    /// Decisions to append.
    #[serde(default)]
    pub decisions: Vec<ImportedDecision>,
    /// Patterns to upsert.
    #[serde(default)]
    pub patterns: Vec<ImportedPattern>,
    /// Context entries to upsert.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

/// Decision record in an import.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportedDecision {
    /// Original timestamp; now when absent.
    pub timestamp: Option<String>,
    /// What was decided.
    pub decision: String,
    /// Why.
    pub rationale: String,
    /// Surrounding context.
    pub context: String,
    /// Alternatives considered.
    pub alternatives: String,
}

/// Pattern record in an import.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportedPattern {
    /// Unique name.
    pub name: String,
    /// What the pattern is.
    pub description: String,
    /// Example usage.
    pub example: String,
    /// When to apply it.
    pub when_to_use: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_accepts_export_shape_with_extra_fields() {
        let json = r#"{
            "version": "0.3.2",
            "data": {
                "decisions": [{"id": 7, "timestamp": "2026-01-01T00:00:00Z", "decision": "d", "rationale": "r"}],
                "patterns": [{"name": "p", "description": "x", "updated_at": "2026-01-01T00:00:00Z"}],
                "context": {"k": "v"}
            },
            "stats": {}
        }"#;
        let doc: ImportDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.data.decisions.len(), 1);
        assert_eq!(doc.data.decisions[0].timestamp.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert!(doc.data.decisions[0].context.is_empty());
        assert_eq!(doc.data.patterns[0].name, "p");
        assert_eq!(doc.data.context.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_import_rejects_wrong_types() {
        let json = r#"{"data": {"decisions": [{"decision": 5}]}}"#;
        assert!(serde_json::from_str::<ImportDocument>(json).is_err());

        let json = r#"{"data": {"patterns": {"name": "p"}}}"#;
        assert!(serde_json::from_str::<ImportDocument>(json).is_err());
    }

    #[test]
    fn test_import_requires_data_section() {
        assert!(serde_json::from_str::<ImportDocument>(r#"{"version": "1"}"#).is_err());
        let doc: ImportDocument = serde_json::from_str(r#"{"data": {}}"#).unwrap();
        assert!(doc.data.decisions.is_empty());
    }
}
