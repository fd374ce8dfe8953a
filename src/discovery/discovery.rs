//! Service discovery
//!
//! Enumerates and watches the `host:port -> module -> rpc-key` tree. A
//! watch fires the callback once immediately with the seed list, then
//! re-enumerates on every child change. Each path is watched at most once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::discovery::client::CoordinationClient;
use crate::discovery::paths::CoordinationPaths;
use crate::discovery::{InstanceChangeCallback, InstanceList, ServiceInstance};
use crate::utils::stable_hash64;

/// Depth of the services tree under its root: host:port / module / key.
const WATCH_DEPTH: usize = 2;

/// Reads and watches the coordination services tree.
pub struct ServiceDiscovery {
    client: Arc<dyn CoordinationClient>,
    paths: CoordinationPaths,
    /// Paths with an installed child watch; a path is watched at most once.
    watched: Mutex<HashSet<String>>,
}

impl ServiceDiscovery {
    pub fn new(client: Arc<dyn CoordinationClient>, paths: CoordinationPaths) -> Arc<Self> {
        Arc::new(ServiceDiscovery {
            client,
            paths,
            watched: Mutex::new(HashSet::new()),
        })
    }

    pub fn services_root(&self) -> String {
        self.paths.services_root()
    }

    /// Enumerate instances.
    ///
    /// Asking for the services root traverses the full two-level tree and
    /// reads every instance value; module nodes without service children are
    /// synthesized as unhealthy placeholders so consumers still see the
    /// module's existence. Any other name yields a single placeholder.
    pub fn get_service_instances(&self, service_name: &str) -> InstanceList {
        if service_name == self.paths.services_root() {
            return self.enumerate_tree();
        }
        let mut placeholder = ServiceInstance::new(service_name, "", "", 0);
        placeholder.healthy = false;
        vec![placeholder]
    }

    fn enumerate_tree(&self) -> InstanceList {
        let services_root = self.paths.services_root();
        let mut instances = Vec::new();

        for address in self.client.get_children(&services_root) {
            let (host, port) = split_address(&address);
            let host_path = self.paths.host_path(&address);

            for module_name in self.client.get_children(&host_path) {
                let module_path = self.paths.module_path(&address, &module_name);
                let services = self.client.get_children(&module_path);

                if services.is_empty() {
                    // Module exists but bears no keys; surface it unhealthy.
                    let mut placeholder = ServiceInstance::new("", &module_name, &host, port);
                    placeholder.healthy = false;
                    placeholder.instance_id = stable_hash64(&module_path);
                    instances.push(placeholder);
                    continue;
                }

                for service_name in services {
                    let service_path =
                        self.paths.service_path(&address, &module_name, &service_name);
                    match self.client.get_data(&service_path) {
                        Some(value) if !value.is_empty() => {
                            instances.push(ServiceInstance::parse(&value));
                        }
                        _ => {
                            warn!(path = %service_path, "service node without value");
                            let mut placeholder =
                                ServiceInstance::new(&service_name, &module_name, &host, port);
                            placeholder.healthy = false;
                            instances.push(placeholder);
                        }
                    }
                }
            }
        }
        instances
    }

    /// Watch the services tree.
    ///
    /// Fires `callback(service_name, seed)` once immediately, then installs
    /// child watches at depths 0, 1 and 2 under the services root. Every
    /// change re-enumerates the tree, re-arms watches over new children and
    /// fires the callback again.
    pub fn watch_service_instances(
        self: &Arc<Self>,
        service_name: &str,
        seed: &[ServiceInstance],
        callback: InstanceChangeCallback,
    ) {
        callback(service_name, seed);
        self.watch_tree(self.paths.services_root(), WATCH_DEPTH, callback);
        info!(service = service_name, "watching service instances");
    }

    /// Watch only the services directory itself, to pick up newly
    /// registered `host:port` entries.
    pub fn watch_services_directory(self: &Arc<Self>, callback: InstanceChangeCallback) {
        let services_root = self.paths.services_root();
        let discovery = Arc::downgrade(self);
        let installed = self.client.watch_children(
            &services_root,
            Arc::new(move |_changed: &str| {
                if let Some(discovery) = discovery.upgrade() {
                    let instances = discovery.enumerate_tree();
                    callback(&discovery.paths.services_root(), &instances);
                }
            }),
        );
        if !installed {
            warn!(path = %services_root, "failed to watch services directory");
        }
    }

    fn watch_tree(self: &Arc<Self>, path: String, depth: usize, callback: InstanceChangeCallback) {
        let newly_watched = self.watched.lock().unwrap_or_else(|e| e.into_inner()).insert(path.clone());
        if newly_watched {
            let discovery = Arc::downgrade(self);
            let rearm_callback = callback.clone();
            let installed = self.client.watch_children(
                &path,
                Arc::new(move |changed: &str| {
                    if let Some(discovery) = discovery.upgrade() {
                        discovery.on_children_changed(changed, &rearm_callback);
                    }
                }),
            );
            if installed {
                debug!(path = %path, "installed child watch");
            } else {
                warn!(path = %path, "failed to install child watch");
            }
        }

        if depth > 0 {
            for child in self.client.get_children(&path) {
                self.watch_tree(format!("{path}/{child}"), depth - 1, callback.clone());
            }
        }
    }

    fn on_children_changed(self: &Arc<Self>, changed: &str, callback: &InstanceChangeCallback) {
        debug!(path = changed, "services tree changed");
        // Arm watches over any children that appeared since the last pass,
        // then hand the consumer a fresh view.
        self.watch_tree(self.paths.services_root(), WATCH_DEPTH, callback.clone());
        let instances = self.enumerate_tree();
        callback(&self.paths.services_root(), &instances);
    }
}

fn split_address(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (address.to_string(), 0),
    }
}
