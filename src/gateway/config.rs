//! Gateway configuration
//!
//! Loaded from a JSON file; every field has a default so an empty object is
//! a valid file. Command-line flags override the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http_server::HttpServerConfig;
use crate::replication::{
    DurabilityPolicy, ManagerOptions, RetryPolicy, DEFAULT_BUSY_TIMEOUT, DEFAULT_MAX_PENDING_ITEMS,
};

/// Configuration load or validation failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Backoff of background shipping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Local SQLite database path (required, may come from `--dsn`)
    #[serde(default)]
    pub dsn: String,

    /// Root directory of the file replica (required, may come from `--replica-dir`)
    #[serde(default)]
    pub replica_dir: String,

    /// Key prefix of this database inside the replica
    #[serde(default = "default_replica_prefix")]
    pub replica_prefix: String,

    #[serde(default)]
    pub http: HttpServerConfig,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    #[serde(default = "default_min_checkpoint_pages")]
    pub min_checkpoint_pages: u64,

    /// Unshipped items kept for a lagging replica before a new generation
    #[serde(default = "default_max_pending_items")]
    pub max_pending_items: usize,

    /// Bound on the final ship at shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Deadline of one HTTP write, confirmation included
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub durability: DurabilityPolicy,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Serve `POST /write` (arbitrary SQL)
    #[serde(default)]
    pub expose_sql_endpoint: bool,
}

fn default_replica_prefix() -> String {
    "db".to_string()
}
fn default_monitor_interval_ms() -> u64 {
    1000
}
fn default_min_checkpoint_pages() -> u64 {
    1000
}
fn default_max_pending_items() -> usize {
    DEFAULT_MAX_PENDING_ITEMS
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    30000
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    30000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            replica_dir: String::new(),
            replica_prefix: default_replica_prefix(),
            http: HttpServerConfig::default(),
            monitor_interval_ms: default_monitor_interval_ms(),
            min_checkpoint_pages: default_min_checkpoint_pages(),
            max_pending_items: default_max_pending_items(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            durability: DurabilityPolicy::default(),
            retry: RetryConfig::default(),
            expose_sql_endpoint: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file. Not validated: flags may still fill
    /// required fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dsn.trim().is_empty() {
            return Err(ConfigError::Invalid("dsn is required".into()));
        }
        if self.replica_dir.trim().is_empty() {
            return Err(ConfigError::Invalid("replica_dir is required".into()));
        }
        if self.replica_prefix.contains("..") {
            return Err(ConfigError::Invalid(format!(
                "replica_prefix '{}' must not contain '..'",
                self.replica_prefix
            )));
        }

        for (name, value) in [
            ("monitor_interval_ms", self.monitor_interval_ms),
            ("min_checkpoint_pages", self.min_checkpoint_pages),
            ("max_pending_items", self.max_pending_items as u64),
            ("request_timeout_ms", self.request_timeout_ms),
            ("retry.initial_backoff_ms", self.retry.initial_backoff_ms),
            ("retry.max_backoff_ms", self.retry.max_backoff_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn dsn_path(&self) -> &Path {
        Path::new(&self.dsn)
    }

    pub fn replica_path(&self) -> &Path {
        Path::new(&self.replica_dir)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            min_checkpoint_pages: self.min_checkpoint_pages,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            max_pending_items: self.max_pending_items,
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, value: serde_json::Value) -> PathBuf {
        let path = dir.path().join("walgate.json");
        fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn test_config_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, json!({}));

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.monitor_interval_ms, 1000);
        assert_eq!(config.min_checkpoint_pages, 1000);
        assert_eq!(config.max_pending_items, 1024);
        assert_eq!(config.shutdown_grace_ms, 5000);
        assert_eq!(config.request_timeout_ms, 30000);
        assert_eq!(config.durability, DurabilityPolicy::All);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.retry.max_backoff_ms, 30000);
        assert!(!config.expose_sql_endpoint);
    }

    #[test]
    fn test_config_overrides() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            json!({
                "dsn": "/data/app.db",
                "replica_dir": "/replica",
                "durability": "any",
                "http": {"port": 8080},
                "retry": {"max_backoff_ms": 5000}
            }),
        );

        let config = GatewayConfig::load(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.durability, DurabilityPolicy::Any);
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.retry.initial_backoff_ms, 100);

        let options = config.manager_options();
        assert_eq!(options.retry.max_backoff, Duration::from_secs(5));
        assert_eq!(options.monitor_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_missing_paths_and_zero_intervals() {
        let config = GatewayConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(m)) if m.contains("dsn")));

        let mut config = GatewayConfig {
            dsn: "app.db".into(),
            replica_dir: "replica".into(),
            ..Default::default()
        };
        config.validate().unwrap();

        config.monitor_interval_ms = 0;
        assert!(config.validate().is_err());

        config.monitor_interval_ms = 1000;
        config.max_pending_items = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(m)) if m.contains("max_pending_items")));
    }

    #[test]
    fn test_invalid_json_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(GatewayConfig::load(&path), Err(ConfigError::Parse(_))));
        assert!(matches!(
            GatewayConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }
}
