//! Coordination-backed service discovery
//!
//! The coordination service holds a tree of `host:port -> module -> rpc-key`
//! entries whose leaves are ephemeral, so a node's services disappear with
//! its session. The registry publishes, discovery enumerates and watches,
//! and the cluster router consumes the change stream.

pub mod client;
pub mod discovery;
pub mod invoker;
pub mod module;
pub mod paths;
pub mod registry;

pub use client::{CoordinationClient, MemoryCoordinationClient};
pub use discovery::ServiceDiscovery;
pub use module::DiscoveryModule;
pub use paths::CoordinationPaths;
pub use registry::ServiceRegistry;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::utils::stable_hash64;
use crate::{ConnId, InstanceId};

/// One service instance as recorded in the coordination tree.
///
/// `connection_id` is a local annotation used by the cluster router and is
/// never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Service key rendered decimally.
    pub service_name: String,
    pub module_name: String,
    pub instance_id: InstanceId,
    pub host: String,
    pub port: u16,
    pub healthy: bool,
    #[serde(skip)]
    pub connection_id: ConnId,
    /// zone / idc / version / weight and friends.
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    pub fn new(service_name: &str, module_name: &str, host: &str, port: u16) -> Self {
        ServiceInstance {
            service_name: service_name.to_string(),
            module_name: module_name.to_string(),
            instance_id: stable_hash64(service_name),
            host: host.to_string(),
            port,
            healthy: true,
            connection_id: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// The `host:port` pair this instance lives at.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Textual form stored as the ephemeral node value:
    /// `host:port;module_name:...;service_name:...;instance_id:...;healthy:...(;k=v)*`
    pub fn serialize(&self) -> String {
        let mut data = format!("{}:{}", self.host, self.port);
        data.push_str(";module_name:");
        data.push_str(&self.module_name);
        data.push_str(";service_name:");
        data.push_str(&self.service_name);
        data.push_str(";instance_id:");
        data.push_str(&self.instance_id.to_string());
        data.push_str(";healthy:");
        data.push_str(if self.healthy { "true" } else { "false" });
        for (key, value) in &self.metadata {
            data.push(';');
            data.push_str(key);
            data.push('=');
            data.push_str(value);
        }
        data
    }

    /// Exact inverse of [`ServiceInstance::serialize`]. Unknown or damaged
    /// segments are skipped; missing fields keep their defaults.
    pub fn parse(data: &str) -> ServiceInstance {
        let mut instance = ServiceInstance {
            service_name: String::new(),
            module_name: String::new(),
            instance_id: 0,
            host: String::new(),
            port: 0,
            healthy: true,
            connection_id: 0,
            metadata: BTreeMap::new(),
        };

        let mut segments = data.split(';');
        if let Some(host_port) = segments.next() {
            if let Some((host, port)) = host_port.rsplit_once(':') {
                instance.host = host.to_string();
                instance.port = port.parse().unwrap_or(0);
            } else {
                instance.host = host_port.to_string();
            }
        }

        for segment in segments {
            if let Some((key, value)) = segment.split_once(':') {
                match key {
                    "module_name" => instance.module_name = value.to_string(),
                    "service_name" => instance.service_name = value.to_string(),
                    "instance_id" => instance.instance_id = value.parse().unwrap_or(0),
                    "healthy" => instance.healthy = value == "true",
                    _ => {}
                }
            } else if let Some((key, value)) = segment.split_once('=') {
                if !key.is_empty() {
                    instance
                        .metadata
                        .insert(key.to_string(), value.to_string());
                }
            }
        }
        instance
    }
}

/// Instances of one service (or the whole tree).
pub type InstanceList = Vec<ServiceInstance>;

/// Change notification: service name plus the re-enumerated instance list.
/// Callbacks must be thread-safe and must not block the coordination client.
pub type InstanceChangeCallback = Arc<dyn Fn(&str, &[ServiceInstance]) + Send + Sync>;
