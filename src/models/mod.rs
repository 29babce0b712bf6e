//! Data models for memkeep.

mod memory;
mod report;
mod transfer;

pub use memory::{ContextEntry, Decision, DecisionId, DecisionInput, Pattern, PatternInput};
pub use report::{
    HealthCheck, HealthReport, HealthStatus, ImportReport, MemoryStats, PurgeOutcome, PurgeReport,
    RateLimitStatus,
};
pub use transfer::{
    ExportData, ExportDocument, ImportData, ImportDocument, ImportedDecision, ImportedPattern,
};
