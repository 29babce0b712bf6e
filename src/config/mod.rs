//! Configuration management.
//!
//! Values resolve in three layers: built-in defaults, an optional TOML file,
//! then `MEMKEEP_*` environment variables.

pub(crate) mod env;
mod limits;

pub use env::{EnvLookup, parse_bool, process_env};
pub use limits::{CapacityLimits, ImportLimits};

use crate::observability::{LoggingConfig, MetricsConfig};
use crate::security::RateLimitConfig;
use crate::storage::{PoolConfig, RetryPolicy};
use crate::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Default lifetime of a purge confirmation token.
pub const DEFAULT_PURGE_TOKEN_TTL: Duration = Duration::from_secs(60);

static UNSAFE_PATH_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"[^\w\-]").unwrap()
});

/// Main configuration for memkeep.
#[derive(Debug, Clone)]
pub struct MemkeepConfig {
    /// Path to the `SQLite` database file.
    pub db_path: PathBuf,
    /// Connection pool sizing and backpressure.
    pub pool: PoolConfig,
    /// Rate limiter settings.
    pub rate_limit: RateLimitConfig,
    /// Per-entity capacity limits.
    pub capacity: CapacityLimits,
    /// Import payload limits.
    pub import: ImportLimits,
    /// Retry policy for transient store errors.
    pub retry: RetryPolicy,
    /// Lifetime of purge confirmation tokens.
    pub purge_token_ttl: Duration,
    /// Logging output.
    pub logging: LoggingConfig,
    /// Prometheus exporter.
    pub metrics: MetricsConfig,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Database path.
    pub db_path: Option<String>,
    /// Purge token TTL in seconds.
    pub purge_token_ttl_secs: Option<u64>,
    /// Pool section.
    pub pool: Option<ConfigFilePool>,
    /// Rate limit section.
    pub rate_limit: Option<ConfigFileRateLimit>,
    /// Capacity section.
    pub limits: Option<ConfigFileLimits>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
}

/// Pool section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFilePool {
    /// Pooled handles.
    pub size: Option<usize>,
    /// Temporary overflow handles.
    pub max_temp: Option<usize>,
    /// Wait queue capacity.
    pub queue_capacity: Option<usize>,
    /// Wait timeout in milliseconds.
    pub wait_timeout_ms: Option<u64>,
}

/// Rate limit section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileRateLimit {
    /// Operations per window.
    pub max_ops: Option<usize>,
    /// Window length in seconds.
    pub window_secs: Option<u64>,
    /// Persist the window across restarts.
    pub persist: Option<bool>,
    /// Durable cleanup interval in seconds.
    pub cleanup_interval_secs: Option<u64>,
}

/// Capacity section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLimits {
    /// Maximum stored decisions.
    pub max_decisions: Option<usize>,
    /// Maximum stored patterns.
    pub max_patterns: Option<usize>,
    /// Maximum stored context keys.
    pub max_context_keys: Option<usize>,
}

/// Logging section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLogging {
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Optional log file.
    pub file: Option<String>,
    /// Filter directive, e.g. `memkeep=debug`.
    pub filter: Option<String>,
}

impl Default for MemkeepConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("memkeep.db"),
            pool: PoolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            capacity: CapacityLimits::default(),
            import: ImportLimits::default(),
            retry: RetryPolicy::default(),
            purge_token_ttl: DEFAULT_PURGE_TOKEN_TTL,
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl MemkeepConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, the default database location and environment overrides.
    ///
    /// Never fails: an undeterminable data directory falls back to the
    /// current directory.
    #[must_use]
    pub fn load_default() -> Self {
        let mut config = Self::default();
        match default_db_path() {
            Ok(path) => config.db_path = path,
            Err(e) => tracing::warn!(error = %e, "Falling back to ./memkeep.db"),
        }
        config.with_env_overrides()
    }

    /// Loads configuration from a TOML file, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::operation("read_config_file", format!("{}: {e}", path.display())))?;
        let file: ConfigFile = toml::from_str(&contents)
            .map_err(|e| Error::operation("parse_config_file", e))?;

        let mut config = Self::load_default();
        config.apply_file(file);
        Ok(config.with_env_overrides())
    }

    /// Applies environment variable overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(&process_env)
    }

    /// Applies overrides from an arbitrary key lookup.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvLookup<'_>) -> Self {
        if let Some(path) = env("MEMKEEP_DB").filter(|p| !p.trim().is_empty()) {
            self.db_path = PathBuf::from(path);
        }
        if let Some(secs) = env("MEMKEEP_PURGE_TOKEN_TTL_SECS").and_then(|v| v.parse::<u64>().ok())
        {
            self.purge_token_ttl = Duration::from_secs(secs.max(1));
        }
        self.pool = self.pool.with_overrides(env);
        self.rate_limit = self.rate_limit.with_overrides(env);
        self.capacity = self.capacity.with_overrides(env);
        self.import = self.import.with_overrides(env);
        self.retry = self.retry.with_overrides(env);
        self.logging = self.logging.with_overrides(env);
        self.metrics = self.metrics.with_overrides(env);
        self
    }

    /// Sets the database path.
    #[must_use]
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Sets the pool configuration.
    #[must_use]
    pub const fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the rate limit configuration.
    #[must_use]
    pub const fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Sets the capacity limits.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: CapacityLimits) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the purge token lifetime.
    #[must_use]
    pub const fn with_purge_token_ttl(mut self, ttl: Duration) -> Self {
        self.purge_token_ttl = ttl;
        self
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(path) = file.db_path {
            self.db_path = PathBuf::from(path);
        }
        if let Some(secs) = file.purge_token_ttl_secs {
            self.purge_token_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(pool) = file.pool {
            if let Some(size) = pool.size {
                self.pool.size = size.max(1);
            }
            if let Some(max_temp) = pool.max_temp {
                self.pool.max_temp = max_temp;
            }
            if let Some(queue_capacity) = pool.queue_capacity {
                self.pool.queue_capacity = queue_capacity;
            }
            if let Some(ms) = pool.wait_timeout_ms {
                self.pool.wait_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(rate) = file.rate_limit {
            if let Some(max_ops) = rate.max_ops {
                self.rate_limit.max_ops = max_ops.max(1);
            }
            if let Some(secs) = rate.window_secs {
                self.rate_limit.window = Duration::from_secs(secs.max(1));
            }
            if let Some(persist) = rate.persist {
                self.rate_limit.persist = persist;
            }
            if let Some(secs) = rate.cleanup_interval_secs {
                self.rate_limit.cleanup_interval = Duration::from_secs(secs);
            }
        }
        if let Some(limits) = file.limits {
            if let Some(n) = limits.max_decisions {
                self.capacity.max_decisions = n.max(1);
            }
            if let Some(n) = limits.max_patterns {
                self.capacity.max_patterns = n.max(1);
            }
            if let Some(n) = limits.max_context_keys {
                self.capacity.max_context_keys = n.max(1);
            }
        }
        if let Some(logging) = file.logging {
            self.logging.apply_file(logging);
        }
    }
}

/// Returns the default database path: `<data_local_dir>/memkeep/<project>.db`.
///
/// The project name is the current directory's name with anything outside
/// `[A-Za-z0-9_-]` replaced by `_`.
///
/// # Errors
///
/// Returns an error if the user data directory cannot be determined.
pub fn default_db_path() -> Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .map(|b| b.data_local_dir().join("memkeep"))
        .ok_or_else(|| {
            Error::operation("get_user_data_dir", "could not determine user data directory")
        })?;
    let project = std::env::current_dir()
        .ok()
        .and_then(|cwd| cwd.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "default".to_string());
    Ok(base.join(format!("{}.db", sanitize_project_name(&project))))
}

fn sanitize_project_name(name: &str) -> String {
    UNSAFE_PATH_CHARS.replace_all(name, "_").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = MemkeepConfig::default();
        assert_eq!(config.pool.size, 5);
        assert_eq!(config.pool.max_temp, 10);
        assert_eq!(config.pool.queue_capacity, 50);
        assert_eq!(config.pool.wait_timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limit.max_ops, 100);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert!(!config.rate_limit.persist);
        assert_eq!(config.capacity.max_decisions, 1000);
        assert_eq!(config.capacity.max_patterns, 100);
        assert_eq!(config.capacity.max_context_keys, 50);
        assert_eq!(config.purge_token_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_env_overrides_apply() {
        let env = lookup(&[
            ("MEMKEEP_DB", "/tmp/custom.db"),
            ("MEMKEEP_POOL_SIZE", "2"),
            ("MEMKEEP_POOL_MAX_TEMP", "1"),
            ("MEMKEEP_POOL_QUEUE_CAPACITY", "1"),
            ("MEMKEEP_POOL_WAIT_TIMEOUT_MS", "1000"),
            ("MEMKEEP_RATE_LIMIT", "3"),
            ("MEMKEEP_PERSIST_RATE_LIMIT", "true"),
            ("MEMKEEP_MAX_PATTERNS", "7"),
        ]);
        let config = MemkeepConfig::default().with_overrides(&env);
        assert_eq!(config.db_path, PathBuf::from("/tmp/custom.db"));
        assert_eq!(config.pool.size, 2);
        assert_eq!(config.pool.max_temp, 1);
        assert_eq!(config.pool.queue_capacity, 1);
        assert_eq!(config.pool.wait_timeout, Duration::from_secs(1));
        assert_eq!(config.rate_limit.max_ops, 3);
        assert!(config.rate_limit.persist);
        assert_eq!(config.capacity.max_patterns, 7);
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let env = lookup(&[
            ("MEMKEEP_POOL_SIZE", "lots"),
            ("MEMKEEP_RATE_LIMIT", "-4"),
        ]);
        let config = MemkeepConfig::default().with_overrides(&env);
        assert_eq!(config.pool.size, 5);
        assert_eq!(config.rate_limit.max_ops, 100);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memkeep.toml");
        std::fs::write(
            &path,
            r#"
db_path = "/var/lib/memkeep/team.db"
purge_token_ttl_secs = 30

[pool]
size = 8
max_temp = 2

[rate_limit]
max_ops = 250
persist = true

[limits]
max_decisions = 500
"#,
        )
        .unwrap();

        let mut config = MemkeepConfig::default();
        let file: ConfigFile = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        config.apply_file(file);

        assert_eq!(config.db_path, PathBuf::from("/var/lib/memkeep/team.db"));
        assert_eq!(config.purge_token_ttl, Duration::from_secs(30));
        assert_eq!(config.pool.size, 8);
        assert_eq!(config.pool.max_temp, 2);
        assert_eq!(config.rate_limit.max_ops, 250);
        assert!(config.rate_limit.persist);
        assert_eq!(config.capacity.max_decisions, 500);
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        let result: std::result::Result<ConfigFile, _> = toml::from_str("pool_size = 3");
        assert!(result.is_err());
    }

    #[test]
    fn test_sanitize_project_name() {
        assert_eq!(sanitize_project_name("my project!"), "my_project_");
        assert_eq!(sanitize_project_name("api-v2_core"), "api-v2_core");
    }
}
