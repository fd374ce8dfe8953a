//! Node configuration
//!
//! Schema for the per-node configuration file, loaded through the
//! multi-format loader in [`loader`]. Unknown fields are ignored; every
//! recognized option has a default so an empty document is a valid config.

pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Network boundary configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Transport worker threads (also sizes the runtime in the binary).
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default)]
    pub listen: ListenConfig,
}

fn default_worker_threads() -> usize {
    1
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            worker_threads: 1,
            listen: ListenConfig::default(),
        }
    }
}

/// Listen address for inbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_ip")]
    pub ip: String,

    #[serde(default = "default_listen_port")]
    pub port: u16,
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    9527
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            ip: default_listen_ip(),
            port: default_listen_port(),
        }
    }
}

/// Coordination-service session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Endpoint list; empty selects the in-process backend.
    #[serde(default)]
    pub hosts: String,

    #[serde(default = "default_coordination_root")]
    pub root: String,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Optional digest auth forwarded to the client before registration.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

fn default_coordination_root() -> String {
    "/basenode".to_string()
}

fn default_session_timeout_ms() -> u64 {
    3000
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        CoordinationConfig {
            hosts: String::new(),
            root: default_coordination_root(),
            session_timeout_ms: default_session_timeout_ms(),
            auth: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// Per-node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub zk: CoordinationConfig,

    /// Advertised `host:port` published by the service registry. Falls back
    /// to the listen address when empty.
    #[serde(default)]
    pub service_hosts: String,

    /// Ordered list of module package names to load.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Container tick interval in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network: NetworkConfig::default(),
            zk: CoordinationConfig::default(),
            service_hosts: String::new(),
            modules: Vec::new(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl NodeConfig {
    /// Load a configuration file (JSON, YAML or XML by extension), resolve
    /// `$ref` inclusions and deserialize.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<NodeConfig> {
        let value = loader::load_file(path.as_ref())?;
        let config = serde_json::from_value(value)?;
        Ok(config)
    }

    /// The `host:port` this node advertises in the registry.
    pub fn advertised_address(&self) -> (String, u16) {
        if let Some((host, port)) = self.service_hosts.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.network.listen.ip.clone(), self.network.listen.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = NodeConfig::default();
        assert_eq!(config.network.worker_threads, 1);
        assert_eq!(config.network.listen.ip, "0.0.0.0");
        assert_eq!(config.network.listen.port, 9527);
        assert_eq!(config.zk.root, "/basenode");
        assert_eq!(config.zk.session_timeout_ms, 3000);
        assert!(config.zk.auth.is_none());
        assert!(config.modules.is_empty());
        assert_eq!(config.tick_interval_ms, 1000);
    }

    #[test]
    fn advertised_address_prefers_service_hosts() {
        let mut config = NodeConfig::default();
        config.service_hosts = "10.0.0.7:9100".to_string();
        assert_eq!(config.advertised_address(), ("10.0.0.7".to_string(), 9100));

        config.service_hosts.clear();
        assert_eq!(config.advertised_address(), ("0.0.0.0".to_string(), 9527));
    }
}
