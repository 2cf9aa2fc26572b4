//! Unified configuration system for relcache.
//!
//! Configuration is loaded with precedence: overrides > env vars > config
//! file > defaults. The crate never reads configuration implicitly; the host
//! loads a [`CacheConfig`] and hands it to the engine at construction.
//!
//! # Example config file (relcache.toml)
//! ```toml
//! enabled = true
//! degrade_on_failure = true
//! lock_ttl_secs = 60
//! max_scan = 1000
//!
//! [cluster]
//! nodes = ["cache-0", "cache-1", "cache-2"]
//!
//! [local]
//! process_capacity = 100000
//! exclude = ["^session:", "_volatile$"]
//! ```

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the cache engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. When false, every read computes directly and every
    /// invalidation is a no-op.
    pub enabled: bool,
    /// Fail-open (`true`): connectivity faults degrade to miss/no-op,
    /// logged and counted. Fail-closed (`false`): they propagate. Applied
    /// uniformly to reads, writes, and invalidations.
    pub degrade_on_failure: bool,
    /// Stampede lock TTL in seconds; also bounds one signal wait.
    pub lock_ttl_secs: u64,
    /// Soft deadline for one atomic invalidation pass, in milliseconds.
    pub script_timeout_ms: u64,
    /// Maximum registrations scanned per invalidation pass per shard.
    pub max_scan: usize,
    /// Cluster topology descriptor.
    pub cluster: ClusterConfig,
    /// Local layer settings.
    pub local: LocalConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            degrade_on_failure: true,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            script_timeout_ms: DEFAULT_SCRIPT_TIMEOUT_MS,
            max_scan: DEFAULT_MAX_SCAN,
            cluster: ClusterConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Load configuration with precedence: overrides > env > file > defaults.
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CacheConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // RELCACHE_LOCAL__EXCLUDE style: double underscore nests sections.
        figment = figment.merge(Env::prefixed("RELCACHE_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no overrides).
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }

    pub fn script_deadline(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms.max(1))
    }
}

/// Storage-cluster topology descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Master node identifiers, in stable order.
    pub nodes: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_cluster_nodes(),
        }
    }
}

/// Local layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Capacity of the process-lifetime layer, in entries.
    pub process_capacity: usize,
    /// Resource-name patterns never served from the unit-of-work layer,
    /// regardless of unit kind.
    pub exclude: Vec<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            process_capacity: DEFAULT_PROCESS_CAPACITY,
            exclude: Vec::new(),
        }
    }
}

impl LocalConfig {
    /// Compile the exclude patterns; invalid patterns fail configuration,
    /// not individual reads.
    pub fn exclude_set(&self) -> Result<RegexSet, ConfigError> {
        RegexSet::new(&self.exclude).map_err(|e| ConfigError {
            message: format!("bad exclude pattern: {e}"),
        })
    }
}

/// Programmatic overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degrade_on_failure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_ttl_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_scan: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalConfig>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert!(config.degrade_on_failure);
        assert_eq!(config.lock_ttl_secs, DEFAULT_LOCK_TTL_SECS);
        assert_eq!(config.max_scan, DEFAULT_MAX_SCAN);
        assert_eq!(config.cluster.nodes, vec!["cache-0".to_string()]);
    }

    #[test]
    fn test_overrides_win() {
        let overrides = ConfigOverrides {
            enabled: Some(false),
            max_scan: Some(5),
            ..ConfigOverrides::default()
        };
        let config = CacheConfig::load(None, overrides).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.max_scan, 5);
        // Untouched fields keep their defaults.
        assert_eq!(config.lock_ttl_secs, DEFAULT_LOCK_TTL_SECS);
    }

    #[test]
    fn test_file_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relcache.toml");
        std::fs::write(
            &path,
            r#"
lock_ttl_secs = 30

[cluster]
nodes = ["cache-0", "cache-1"]

[local]
process_capacity = 64
"#,
        )
        .unwrap();

        let config =
            CacheConfig::load(Some(path.to_str().unwrap()), ConfigOverrides::default()).unwrap();
        assert_eq!(config.lock_ttl_secs, 30);
        assert_eq!(config.cluster.nodes.len(), 2);
        assert_eq!(config.local.process_capacity, 64);
        // Fields the file omits keep their defaults.
        assert_eq!(config.max_scan, DEFAULT_MAX_SCAN);
    }

    #[test]
    fn test_exclude_set_compiles() {
        let local = LocalConfig {
            exclude: vec!["^session:".to_string(), "_volatile$".to_string()],
            ..LocalConfig::default()
        };
        let set = local.exclude_set().unwrap();
        assert!(set.is_match("session:abc"));
        assert!(set.is_match("report_volatile"));
        assert!(!set.is_match("users:q1"));
    }

    #[test]
    fn test_bad_exclude_pattern_fails_config() {
        let local = LocalConfig {
            exclude: vec!["(".to_string()],
            ..LocalConfig::default()
        };
        assert!(local.exclude_set().is_err());
    }

    #[test]
    fn test_durations() {
        let config = CacheConfig {
            lock_ttl_secs: 0,
            script_timeout_ms: 0,
            ..CacheConfig::default()
        };
        // Zero is clamped so waits and deadlines stay meaningful.
        assert_eq!(config.lock_ttl(), Duration::from_secs(1));
        assert_eq!(config.script_deadline(), Duration::from_millis(1));
    }
}
