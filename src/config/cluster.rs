//! Cluster Configuration
//!
//! Static-peer clustering: every node dials each address in `peers` and
//! accepts links on `listen_addr`. The peer list is expected to describe a
//! full mesh.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::cluster::DEFAULT_MAX_FRAME_SIZE;

/// Cluster configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Node identifier (taken from the hostname if not set)
    pub node_id: Option<String>,

    /// Address accepting links from peers
    /// Default: 0.0.0.0:7947
    pub listen_addr: SocketAddr,

    /// Peer link addresses, "host:port"
    pub peers: Vec<String>,

    /// Timeout for dialing a peer
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// First reconnect delay after a link fails; doubles up to `reconnect_max`
    #[serde(with = "humantime_serde")]
    pub reconnect_min: Duration,

    #[serde(with = "humantime_serde")]
    pub reconnect_max: Duration,

    /// Largest cluster frame accepted from a peer
    pub max_frame_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7947)),
            peers: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClusterConfig {
    /// Get the node ID, falling back to the hostname
    pub fn get_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("node-{}", rand_id()))
        })
    }
}

/// Generate a random-ish ID for node identification
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
        assert_eq!(config.listen_addr, SocketAddr::from(([0, 0, 0, 0], 7947)));
        assert!(config.peers.is_empty());
        assert_eq!(config.reconnect_min, Duration::from_secs(1));
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
        assert!(!config.get_node_id().is_empty());
    }

    #[test]
    fn test_humantime_durations() {
        let config: ClusterConfig = toml::from_str(
            r#"
            enabled = true
            peers = ["10.0.0.2:7947"]
            connect_timeout = "2s"
            reconnect_max = "1m"
            "#,
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.reconnect_max, Duration::from_secs(60));
        assert_eq!(config.reconnect_min, Duration::from_secs(1));
    }
}
