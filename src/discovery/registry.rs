//! Service registry
//!
//! Publishes `host:port -> module -> rpc-key` entries into the coordination
//! service. Parents are persistent (other modules may share them); the
//! service leaf is ephemeral so it lives exactly as long as the session.
//! Writes are gated on session state: registrations arriving while
//! disconnected are deferred and flushed on reconnect.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::discovery::client::CoordinationClient;
use crate::discovery::paths::CoordinationPaths;
use crate::discovery::ServiceInstance;
use crate::error::ErrorCode;

/// Session-bound publisher of service instances.
pub struct ServiceRegistry {
    client: Arc<dyn CoordinationClient>,
    paths: CoordinationPaths,
    process_id: String,
    /// `{root}/services/{host:port}` nodes this registry created.
    tracked_hosts: Mutex<HashSet<String>>,
    /// `{root}/services/{host:port}/{module}` nodes this registry created.
    tracked_modules: Mutex<HashSet<String>>,
    /// Registrations deferred while the session was down.
    deferred: Mutex<Vec<ServiceInstance>>,
}

impl ServiceRegistry {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        paths: CoordinationPaths,
        process_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(ServiceRegistry {
            client,
            paths,
            process_id: process_id.into(),
            tracked_hosts: Mutex::new(HashSet::new()),
            tracked_modules: Mutex::new(HashSet::new()),
            deferred: Mutex::new(Vec::new()),
        })
    }

    /// Open the session: subscribe to state changes, create the persistent
    /// roots and the ephemeral process node.
    pub fn init(self: &Arc<Self>) -> Result<(), ErrorCode> {
        let registry = Arc::downgrade(self);
        self.client.watch_session(Arc::new(move |connected| {
            if let Some(registry) = registry.upgrade() {
                registry.on_session_state(connected);
            }
        }));

        if !self.client.is_connected() {
            warn!("coordination session not connected at init; registrations will be deferred");
            return Ok(());
        }

        let ok = self.client.ensure_path(self.paths.root())
            && self.client.ensure_path(&self.paths.processes_root())
            && self.client.ensure_path(&self.paths.services_root())
            && self
                .client
                .create_ephemeral(&self.paths.process_path(&self.process_id), "");
        if !ok {
            error!(process_id = %self.process_id, "failed to create registry base paths");
            return Err(ErrorCode::InvalidArguments);
        }
        info!(process_id = %self.process_id, root = self.paths.root(), "registry session opened");
        Ok(())
    }

    /// Publish one instance. While disconnected the instance is queued and
    /// flushed from the session-connected notification.
    pub fn register_service(&self, instance: &ServiceInstance) -> bool {
        if !self.client.is_connected() {
            debug!(
                service = %instance.service_name,
                "session down, deferring registration"
            );
            self.lock(&self.deferred).push(instance.clone());
            return true;
        }
        self.publish(instance)
    }

    fn publish(&self, instance: &ServiceInstance) -> bool {
        let address = instance.address();
        let host_path = self.paths.host_path(&address);
        let module_path = self.paths.module_path(&address, &instance.module_name);

        if !self.client.ensure_path(self.paths.root())
            || !self.client.ensure_path(&self.paths.services_root())
        {
            return false;
        }
        if !self.ensure_tracked(&host_path, &self.tracked_hosts) {
            return false;
        }
        if !self.ensure_tracked(&module_path, &self.tracked_modules) {
            return false;
        }

        let service_path =
            self.paths
                .service_path(&address, &instance.module_name, &instance.service_name);
        let value = instance.serialize();
        let ok = self.client.create_ephemeral(&service_path, &value);
        if ok {
            info!(path = %service_path, value = %value, "registered service");
        } else {
            error!(path = %service_path, "failed to register service");
        }
        ok
    }

    /// Module node without service children, for modules bearing no RPC keys.
    pub fn register_module(&self, address: &str, module_name: &str) -> bool {
        if !self.client.is_connected() {
            debug!(module = module_name, "session down, skipping module node");
            return true;
        }
        let host_path = self.paths.host_path(address);
        let module_path = self.paths.module_path(address, module_name);
        self.ensure_tracked(&host_path, &self.tracked_hosts)
            && self.ensure_tracked(&module_path, &self.tracked_modules)
    }

    /// Delete the service, module and host:port nodes in that order,
    /// ignoring "not found".
    pub fn deregister_service(&self, instance: &ServiceInstance) -> bool {
        let address = instance.address();
        let service_path =
            self.paths
                .service_path(&address, &instance.module_name, &instance.service_name);
        let module_path = self.paths.module_path(&address, &instance.module_name);
        let host_path = self.paths.host_path(&address);

        let ok = self.client.delete(&service_path)
            && self.client.delete(&module_path)
            && self.client.delete(&host_path);
        self.lock(&self.tracked_modules).remove(&module_path);
        self.lock(&self.tracked_hosts).remove(&host_path);
        info!(path = %service_path, ok, "deregistered service");
        ok
    }

    /// Heartbeat: rewrite the instance value; fails if the node is gone.
    pub fn renew_service(&self, instance: &ServiceInstance) -> bool {
        let path = self.paths.service_path(
            &instance.address(),
            &instance.module_name,
            &instance.service_name,
        );
        if self.client.get_data(&path).is_none() {
            return false;
        }
        self.client.set_data(&path, &instance.serialize())
    }

    /// Delete the ephemeral process node (shutdown path).
    pub fn shutdown(&self) {
        self.client
            .delete(&self.paths.process_path(&self.process_id));
    }

    /// Tracked-set sizes, for tests and diagnostics.
    pub fn tracked_counts(&self) -> (usize, usize) {
        (
            self.lock(&self.tracked_hosts).len(),
            self.lock(&self.tracked_modules).len(),
        )
    }

    fn ensure_tracked(&self, path: &str, tracked: &Mutex<HashSet<String>>) -> bool {
        let created = !self.client.exists(path);
        if !self.client.ensure_path(path) {
            return false;
        }
        if created {
            self.lock(tracked).insert(path.to_string());
        }
        true
    }

    fn on_session_state(&self, connected: bool) {
        if connected {
            let deferred: Vec<ServiceInstance> = self.lock(&self.deferred).drain(..).collect();
            if !deferred.is_empty() {
                info!(count = deferred.len(), "session restored, flushing deferred registrations");
            }
            for instance in deferred {
                self.publish(&instance);
            }
            return;
        }

        warn!("coordination session lost, cleaning up tracked nodes");
        self.cleanup_tracked(&self.tracked_modules);
        self.cleanup_tracked(&self.tracked_hosts);
    }

    /// Remove every tracked node whose children set is empty. Ephemeral
    /// leaves are already gone with the session, so an empty node here is
    /// this process's residue.
    fn cleanup_tracked(&self, tracked: &Mutex<HashSet<String>>) {
        let paths: Vec<String> = self.lock(tracked).iter().cloned().collect();
        for path in paths {
            if self.client.get_children(&path).is_empty() {
                self.client.delete(&path);
                self.lock(tracked).remove(&path);
                debug!(path = %path, "removed empty tracked node");
            }
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}
