//! Configuration loading for stratum.
//!
//! Configuration follows a precedence chain:
//! 1. Environment variables (highest priority)
//! 2. Project config (`.stratum/config.toml`)
//! 3. User config (`~/.stratum/config.toml`)
//! 4. Defaults (lowest priority)
//!
//! All configuration is optional; the service runs on defaults when no
//! config file exists. Loaded configs can be held in a `ConfigCache`,
//! which only re-reads when a source file's modification time advances.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::backends::{RestOptions, SqliteOptions};
use crate::breaker::CircuitBreakerConfig;
use crate::detect::DetectionConfig;
use crate::error::{Result, StratumError};
use crate::migrate::MigrationConfig;
use crate::monitor::MonitorConfig;

/// Main configuration struct for stratum.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Backend registration and failover order.
    pub backends: BackendsConfig,
    /// Remote-service backend connection parameters.
    pub rest: RestConfig,
    /// Relational backend parameters.
    pub sqlite: SqliteConfig,
    /// Document-file backend parameters.
    pub jsonfile: JsonFileConfig,
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Health detection tuning.
    pub detection: DetectionConfig,
    /// Performance monitoring.
    pub monitoring: MonitorConfig,
    /// Migration engine tuning.
    pub migration: MigrationConfig,
}

/// Backend selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendsConfig {
    /// Backend pinned to the front of the selection order.
    pub preferred: Option<String>,
    /// Ordered list of backends tried on failure.
    pub fallback_chain: Vec<String>,
    /// Whether health detection runs at initialization.
    pub auto_detection: bool,
    /// Per-backend enable/disable overrides.
    pub overrides: HashMap<String, bool>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            preferred: None,
            fallback_chain: vec![
                "rest".to_string(),
                "sqlite".to_string(),
                "jsonfile".to_string(),
                "memory".to_string(),
            ],
            auto_detection: true,
            overrides: HashMap::new(),
        }
    }
}

/// Remote-service backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RestConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub api_key: Option<String>,
    pub pool_size: usize,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8002,
            timeout_secs: 30,
            api_key: None,
            pool_size: 10,
        }
    }
}

/// Relational backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: PathBuf,
    pub enable_fts: bool,
    pub enable_wal: bool,
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".stratum/memories.db"),
            enable_fts: true,
            enable_wal: true,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Document-file backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JsonFileConfig {
    pub path: PathBuf,
    pub pretty: bool,
}

impl Default for JsonFileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".stratum/memories.json"),
            pretty: false,
        }
    }
}

impl Config {
    /// Load configuration with the full precedence chain.
    pub fn load() -> Self {
        match env::current_dir() {
            Ok(cwd) => Self::load_from_cwd(&cwd),
            Err(_) => {
                let mut config = Config::default();
                if let Some(user_config) = Self::load_user_config() {
                    config = config.merge(user_config);
                }
                config.apply_env_overrides();
                config
            }
        }
    }

    /// Load configuration with a specific working directory.
    pub fn load_from_cwd(cwd: &Path) -> Self {
        let mut config = Config::default();

        if let Some(user_config) = Self::load_user_config() {
            config = config.merge(user_config);
        }
        if let Some(project_config) = Self::load_project_config(cwd) {
            config = config.merge(project_config);
        }
        config.apply_env_overrides();
        config
    }

    /// Load user config from `~/.stratum/config.toml`.
    fn load_user_config() -> Option<Config> {
        let home = stratum_home()?;
        Self::load_from_file(&home.join("config.toml")).ok()
    }

    /// Load project config from `.stratum/config.toml` in the given directory.
    fn load_project_config(cwd: &Path) -> Option<Config> {
        Self::load_from_file(&project_config_path(cwd)).ok()
    }

    /// Load config from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path).map_err(|e| StratumError::storage(path, e))?;
        toml::from_str(&content).map_err(|e| StratumError::config(e.to_string()))
    }

    /// Connection options for the remote-service backend.
    pub fn rest_options(&self) -> RestOptions {
        RestOptions {
            host: self.rest.host.clone(),
            port: self.rest.port,
            timeout: Duration::from_secs(self.rest.timeout_secs),
            api_key: self.rest.api_key.clone(),
            pool_size: self.rest.pool_size,
            ..RestOptions::default()
        }
    }

    /// Options for the relational backend.
    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            path: self.sqlite.path.clone(),
            enable_fts: self.sqlite.enable_fts,
            enable_wal: self.sqlite.enable_wal,
            busy_timeout_ms: self.sqlite.busy_timeout_ms,
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Invalid values are reported and ignored rather than applied.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STRATUM_PREFERRED_BACKEND") {
            if val.is_empty() {
                self.backends.preferred = None;
            } else {
                self.backends.preferred = Some(val);
            }
        }

        if let Ok(val) = env::var("STRATUM_FALLBACK_CHAIN") {
            let chain: Vec<String> = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if chain.is_empty() {
                eprintln!(
                    "Warning: STRATUM_FALLBACK_CHAIN '{}' contains no backend names. \
                    Keeping configured chain.",
                    val
                );
            } else {
                self.backends.fallback_chain = chain;
            }
        }

        if let Ok(val) = env::var("STRATUM_AUTO_DETECTION") {
            self.backends.auto_detection = val == "true" || val == "1";
        }

        if let Ok(val) = env::var("STRATUM_REST_HOST") {
            if val.is_empty() {
                eprintln!("Warning: STRATUM_REST_HOST is empty. Keeping '{}'.", self.rest.host);
            } else {
                self.rest.host = val;
            }
        }

        if let Ok(val) = env::var("STRATUM_REST_PORT") {
            match val.parse::<u16>() {
                Ok(port) => self.rest.port = port,
                Err(_) => eprintln!(
                    "Warning: Invalid STRATUM_REST_PORT value '{}'. \
                    Expected a port number. Using '{}'.",
                    val, self.rest.port
                ),
            }
        }

        if let Ok(val) = env::var("STRATUM_SQLITE_PATH") {
            if val.is_empty() {
                eprintln!("Warning: STRATUM_SQLITE_PATH is empty. Keeping configured path.");
            } else {
                self.sqlite.path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("STRATUM_FAILURE_THRESHOLD") {
            match val.parse::<u32>() {
                Ok(n) if n >= 1 => self.circuit_breaker.failure_threshold = n,
                Ok(n) => eprintln!(
                    "Warning: Invalid STRATUM_FAILURE_THRESHOLD value '{}'. \
                    Must be >= 1. Using '{}'.",
                    n, self.circuit_breaker.failure_threshold
                ),
                Err(_) => eprintln!(
                    "Warning: Invalid STRATUM_FAILURE_THRESHOLD value '{}'. \
                    Expected a positive integer. Using '{}'.",
                    val, self.circuit_breaker.failure_threshold
                ),
            }
        }

        if let Ok(val) = env::var("STRATUM_RECOVERY_TIMEOUT") {
            match val.parse::<u64>() {
                Ok(n) if n >= 1 => self.circuit_breaker.recovery_timeout_secs = n,
                _ => eprintln!(
                    "Warning: Invalid STRATUM_RECOVERY_TIMEOUT value '{}'. \
                    Expected seconds >= 1. Using '{}'.",
                    val, self.circuit_breaker.recovery_timeout_secs
                ),
            }
        }

        if let Ok(val) = env::var("STRATUM_DETECTION_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(n) if n >= 1 => self.detection.timeout_ms = n,
                _ => eprintln!(
                    "Warning: Invalid STRATUM_DETECTION_TIMEOUT_MS value '{}'. \
                    Expected milliseconds >= 1. Using '{}'.",
                    val, self.detection.timeout_ms
                ),
            }
        }

        if let Ok(val) = env::var("STRATUM_CACHE_TTL") {
            match val.parse::<u64>() {
                Ok(n) => self.detection.cache_ttl_secs = n,
                Err(_) => eprintln!(
                    "Warning: Invalid STRATUM_CACHE_TTL value '{}'. \
                    Expected seconds. Using '{}'.",
                    val, self.detection.cache_ttl_secs
                ),
            }
        }

        if let Ok(val) = env::var("STRATUM_MONITORING_ENABLED") {
            self.monitoring.enabled = val == "true" || val == "1";
        }
    }

    /// Merge another config into this one.
    ///
    /// The `other` config takes precedence: each of its non-default fields
    /// is applied, enabling additive layering where each tier only names
    /// its customizations. A tier cannot explicitly set a value back to
    /// the default over a lower tier's override; that would need
    /// `Option<T>` on every field.
    fn merge(mut self, other: Config) -> Self {
        let default = Config::default();

        if other.backends.preferred.is_some() {
            self.backends.preferred = other.backends.preferred;
        }
        if other.backends.fallback_chain != default.backends.fallback_chain {
            self.backends.fallback_chain = other.backends.fallback_chain;
        }
        if other.backends.auto_detection != default.backends.auto_detection {
            self.backends.auto_detection = other.backends.auto_detection;
        }
        for (k, v) in other.backends.overrides {
            self.backends.overrides.insert(k, v);
        }

        if other.rest.host != default.rest.host {
            self.rest.host = other.rest.host;
        }
        if other.rest.port != default.rest.port {
            self.rest.port = other.rest.port;
        }
        if other.rest.timeout_secs != default.rest.timeout_secs {
            self.rest.timeout_secs = other.rest.timeout_secs;
        }
        if other.rest.api_key.is_some() {
            self.rest.api_key = other.rest.api_key;
        }
        if other.rest.pool_size != default.rest.pool_size {
            self.rest.pool_size = other.rest.pool_size;
        }

        if other.sqlite.path != default.sqlite.path {
            self.sqlite.path = other.sqlite.path;
        }
        if other.sqlite.enable_fts != default.sqlite.enable_fts {
            self.sqlite.enable_fts = other.sqlite.enable_fts;
        }
        if other.sqlite.enable_wal != default.sqlite.enable_wal {
            self.sqlite.enable_wal = other.sqlite.enable_wal;
        }
        if other.sqlite.busy_timeout_ms != default.sqlite.busy_timeout_ms {
            self.sqlite.busy_timeout_ms = other.sqlite.busy_timeout_ms;
        }

        if other.jsonfile.path != default.jsonfile.path {
            self.jsonfile.path = other.jsonfile.path;
        }
        if other.jsonfile.pretty != default.jsonfile.pretty {
            self.jsonfile.pretty = other.jsonfile.pretty;
        }

        if other.circuit_breaker.failure_threshold != default.circuit_breaker.failure_threshold {
            self.circuit_breaker.failure_threshold = other.circuit_breaker.failure_threshold;
        }
        if other.circuit_breaker.recovery_timeout_secs
            != default.circuit_breaker.recovery_timeout_secs
        {
            self.circuit_breaker.recovery_timeout_secs =
                other.circuit_breaker.recovery_timeout_secs;
        }
        if other.circuit_breaker.test_requests != default.circuit_breaker.test_requests {
            self.circuit_breaker.test_requests = other.circuit_breaker.test_requests;
        }
        if other.circuit_breaker.success_threshold != default.circuit_breaker.success_threshold {
            self.circuit_breaker.success_threshold = other.circuit_breaker.success_threshold;
        }

        if other.detection.timeout_ms != default.detection.timeout_ms {
            self.detection.timeout_ms = other.detection.timeout_ms;
        }
        if other.detection.retries != default.detection.retries {
            self.detection.retries = other.detection.retries;
        }
        if other.detection.cache_ttl_secs != default.detection.cache_ttl_secs {
            self.detection.cache_ttl_secs = other.detection.cache_ttl_secs;
        }

        if other.monitoring.enabled != default.monitoring.enabled {
            self.monitoring.enabled = other.monitoring.enabled;
        }
        if other.monitoring.retention_secs != default.monitoring.retention_secs {
            self.monitoring.retention_secs = other.monitoring.retention_secs;
        }

        if other.migration.backup_dir != default.migration.backup_dir {
            self.migration.backup_dir = other.migration.backup_dir;
        }
        if other.migration.backup_required != default.migration.backup_required {
            self.migration.backup_required = other.migration.backup_required;
        }
        if other.migration.seconds_per_record != default.migration.seconds_per_record {
            self.migration.seconds_per_record = other.migration.seconds_per_record;
        }

        self
    }

    /// Save configuration to the project config file.
    ///
    /// Writes to `.stratum/config.toml` under the given directory, using
    /// an atomic write (temp file, then rename).
    pub fn save_project(&self, cwd: &Path) -> Result<()> {
        let stratum_dir = cwd.join(".stratum");
        if !stratum_dir.exists() {
            fs::create_dir_all(&stratum_dir)
                .map_err(|e| StratumError::storage(&stratum_dir, e))?;
        }

        let config_path = stratum_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| StratumError::config(e.to_string()))?;

        let temp_path = stratum_dir.join(".config.toml.tmp");
        fs::write(&temp_path, &content).map_err(|e| StratumError::storage(&temp_path, e))?;
        fs::rename(&temp_path, &config_path)
            .map_err(|e| StratumError::storage(&config_path, e))?;
        Ok(())
    }
}

/// Get the stratum home directory.
///
/// Checks the `STRATUM_HOME` environment variable first, then falls back
/// to `~/.stratum`.
pub fn stratum_home() -> Option<PathBuf> {
    if let Ok(home) = env::var("STRATUM_HOME") {
        if home.is_empty() {
            tracing::warn!("STRATUM_HOME is empty, using default");
        } else {
            let path = PathBuf::from(&home);
            if path.is_absolute() {
                return Some(path);
            }
            if let Ok(canonical) = path.canonicalize() {
                return Some(canonical);
            }
            tracing::warn!("STRATUM_HOME is relative and doesn't exist, using as-is");
            return Some(path);
        }
    }

    dirs::home_dir().map(|home| home.join(".stratum"))
}

/// Path of the project-level config file under a working directory.
pub fn project_config_path(cwd: &Path) -> PathBuf {
    cwd.join(".stratum").join("config.toml")
}

/// Cached configuration, invalidated by source-file modification times.
///
/// `get` is cheap: it stats the user and project config files and only
/// re-runs the full load when one of them changed (or appeared, or
/// disappeared) since the last load.
pub struct ConfigCache {
    cwd: PathBuf,
    config: Config,
    sources: Vec<(PathBuf, Option<SystemTime>)>,
}

impl ConfigCache {
    /// Load and cache configuration for a working directory.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        let config = Config::load_from_cwd(&cwd);
        let sources = Self::snapshot_sources(&cwd);
        Self {
            cwd,
            config,
            sources,
        }
    }

    fn snapshot_sources(cwd: &Path) -> Vec<(PathBuf, Option<SystemTime>)> {
        let mut paths = Vec::new();
        if let Some(home) = stratum_home() {
            paths.push(home.join("config.toml"));
        }
        paths.push(project_config_path(cwd));

        paths
            .into_iter()
            .map(|path| {
                let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
                (path, mtime)
            })
            .collect()
    }

    /// The current configuration, re-loaded if a source file changed.
    pub fn get(&mut self) -> &Config {
        let current = Self::snapshot_sources(&self.cwd);
        if current != self.sources {
            self.config = Config::load_from_cwd(&self.cwd);
            self.sources = current;
        }
        &self.config
    }
}
