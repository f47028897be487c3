//! Cluster Configuration
//!
//! Node identity, RPC listener address, static membership and timeouts.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::cluster::{Backoff, ClusterNode};

/// Cluster configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Node identifier (auto-generated from hostname if not set)
    pub node_id: Option<String>,

    /// Address for the cluster RPC listener
    /// Default: 0.0.0.0:8933
    #[serde(default = "default_rpc_bind")]
    pub rpc_bind: SocketAddr,

    /// Statically known peers
    #[serde(default)]
    pub peers: Vec<ClusterNode>,

    /// Bound on a single remote call
    /// Default: 5s
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Bound on a single dial plus handshake
    /// Default: 10s
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Keep-alive ping interval on established channels
    /// Default: 30m
    #[serde(default = "default_keepalive_interval", with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Connection retry pacing
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry pacing for dialing peers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after the first failed dial
    /// Default: 1s
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Cap on any single delay
    /// Default: 20s
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Retries after the first dial before the node is evicted
    /// Default: 100
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_rpc_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8933))
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(20)
}

fn default_max_retries() -> u32 {
    100
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            rpc_bind: default_rpc_bind(),
            peers: Vec::new(),
            call_timeout: default_call_timeout(),
            connect_timeout: default_connect_timeout(),
            keepalive_interval: default_keepalive_interval(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_retries: default_max_retries(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            max_retries: self.max_retries,
        }
    }
}

impl ClusterConfig {
    /// Get the node ID, generating from hostname if not set
    pub fn get_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("node-{}", rand_id()))
        })
    }
}

/// Generate a random ID for node identification
fn rand_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xFFFFFFFF)
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(!config.enabled);
        assert!(config.node_id.is_none());
        assert_eq!(config.rpc_bind, "0.0.0.0:8933".parse().unwrap());
        assert!(config.peers.is_empty());
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.keepalive_interval, Duration::from_secs(1800));
        assert_eq!(config.retry.backoff(), Backoff::default());
    }

    #[test]
    fn test_get_node_id_with_explicit() {
        let mut config = ClusterConfig::default();
        config.node_id = Some("my-node".to_string());
        assert_eq!(config.get_node_id(), "my-node");
    }

    #[test]
    fn test_get_node_id_auto_generated() {
        let config = ClusterConfig::default();
        let id = config.get_node_id();
        assert!(!id.is_empty());
    }
}
