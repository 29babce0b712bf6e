//! Structured logging configuration.

use crate::config::{ConfigFileLogging, EnvLookup};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "memkeep=info";
const VERBOSE_FILTER: &str = "memkeep=debug";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses a format name, returning `None` for unknown names.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Log file; stderr when `None`.
    pub file: Option<PathBuf>,
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            file: None,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl LoggingConfig {
    /// Raises the default filter to debug.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose && self.filter == DEFAULT_FILTER {
            self.filter = VERBOSE_FILTER.to_string();
        }
        self
    }

    /// Applies `MEMKEEP_LOG_FORMAT`, `MEMKEEP_LOG_FILE` and `MEMKEEP_LOG_FILTER`.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvLookup<'_>) -> Self {
        if let Some(format) = env("MEMKEEP_LOG_FORMAT").and_then(|v| LogFormat::parse(&v)) {
            self.format = format;
        }
        if let Some(file) = env("MEMKEEP_LOG_FILE").filter(|v| !v.trim().is_empty()) {
            self.file = Some(PathBuf::from(file));
        }
        if let Some(filter) = env("MEMKEEP_LOG_FILTER").filter(|v| !v.trim().is_empty()) {
            self.filter = filter;
        }
        self
    }

    pub(crate) fn apply_file(&mut self, settings: ConfigFileLogging) {
        if let Some(format) = settings.format.as_deref().and_then(LogFormat::parse) {
            self.format = format;
        }
        if let Some(file) = settings.file {
            self.file = Some(PathBuf::from(file));
        }
        if let Some(filter) = settings.filter {
            self.filter = filter;
        }
    }

    /// Builds the subscriber filter, preferring `RUST_LOG`.
    #[must_use]
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}
