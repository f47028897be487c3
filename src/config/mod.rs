//! Configuration Module
//!
//! Provides TOML-based configuration for MeshMQ nodes with support for:
//! - Logging level
//! - Cluster identity, RPC listener and static peer list
//! - Call, connect and keep-alive timeouts
//! - Connection retry pacing
//! - Environment variable overrides (MESHMQ__* prefix)

use std::collections::HashSet;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

// Re-export cluster config types
pub use cluster::{ClusterConfig, RetryConfig};

mod cluster;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex is valid");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MESHMQ__` prefix with double underscores for nesting:
    ///    - `MESHMQ__CLUSTER__NODE_ID=node-a` overrides `cluster.node_id`
    ///    - `MESHMQ__CLUSTER__CALL_TIMEOUT=2s` overrides `cluster.call_timeout`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("cluster.enabled", false)?
            .set_default("cluster.rpc_bind", "0.0.0.0:8933")?
            .set_default("cluster.call_timeout", "5s")?
            .set_default("cluster.connect_timeout", "10s")?
            .set_default("cluster.keepalive_interval", "30m")?
            .set_default("cluster.retry.initial_delay", "1s")?
            .set_default("cluster.retry.max_delay", "20s")?
            .set_default("cluster.retry.max_retries", 100)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MESHMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cluster = &self.cluster;

        if cluster.call_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "cluster.call_timeout must be greater than zero".to_string(),
            ));
        }

        if cluster.retry.initial_delay.is_zero() {
            return Err(ConfigError::Validation(
                "cluster.retry.initial_delay must be greater than zero".to_string(),
            ));
        }

        if cluster.retry.max_delay < cluster.retry.initial_delay {
            return Err(ConfigError::Validation(
                "cluster.retry.max_delay must not be less than initial_delay".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for peer in &cluster.peers {
            if peer.node_id.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Peer at '{}' has an empty node_id",
                    peer.address
                )));
            }
            if peer.address.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Peer '{}' has an empty address",
                    peer.node_id
                )));
            }
            if !seen.insert(peer.node_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Peer '{}' is listed more than once",
                    peer.node_id
                )));
            }
            if cluster.node_id.as_deref() == Some(peer.node_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Peer '{}' has the same node_id as this node",
                    peer.node_id
                )));
            }
        }

        Ok(())
    }
}
