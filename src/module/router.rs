//! Module router
//!
//! Maintains the service-key and module-id indexes, classifies incoming
//! frames by the header's kind bit, delivers them to module mailboxes and
//! falls back to the designated network module for anything that cannot be
//! delivered locally. Lookups run under the router lock; delivery happens
//! after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::error::ErrorCode;
use crate::frame::FrameKind;
use crate::module::event::ModuleEvent;
use crate::module::host::{event_for_frame, ModuleHost};
use crate::module::traits::{ModuleDescriptor, PostInitContext};
use crate::{ModuleId, ServiceKey};

#[derive(Default)]
struct RouterMaps {
    by_service_key: HashMap<ServiceKey, Arc<ModuleHost>>,
    by_module_id: HashMap<ModuleId, Arc<ModuleHost>>,
    network_module: Option<Arc<ModuleHost>>,
}

/// Steers RPC frames between module mailboxes.
pub struct ModuleRouter {
    maps: Mutex<RouterMaps>,
}

impl ModuleRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(ModuleRouter {
            maps: Mutex::new(RouterMaps::default()),
        })
    }

    /// Register a module and index its handler keys.
    ///
    /// A network module is recorded as the egress target without key
    /// indexing; re-assignment is logged. A normal module is rejected on a
    /// duplicate id, and on any key collision every key just inserted for it
    /// is rolled back.
    pub fn register(
        self: &Arc<Self>,
        module: &Arc<ModuleHost>,
        is_network: bool,
    ) -> Result<(), ErrorCode> {
        let module_id = module.module_id();

        if is_network {
            let mut maps = self.lock_maps();
            if maps.network_module.is_some() {
                warn!(
                    module_id,
                    class = module.class_name(),
                    "replacing previously registered network module"
                );
            }
            maps.network_module = Some(Arc::clone(module));
            info!(
                module_id,
                class = module.class_name(),
                "registered network module"
            );
            return Ok(());
        }

        {
            let mut maps = self.lock_maps();

            if let Some(network) = &maps.network_module {
                if Arc::ptr_eq(network, module) {
                    warn!(
                        module_id,
                        class = module.class_name(),
                        "module already registered as network module, skipping normal registration"
                    );
                    return Ok(());
                }
            }

            if maps.by_module_id.contains_key(&module_id) {
                warn!(
                    module_id,
                    class = module.class_name(),
                    "module already registered"
                );
                return Err(ErrorCode::ModuleAlreadyRegistered);
            }

            let service_keys = module.service_keys();
            if service_keys.is_empty() {
                warn!(
                    module_id,
                    class = module.class_name(),
                    "module has no service handlers"
                );
            }

            for &key in &service_keys {
                if maps.by_service_key.contains_key(&key) {
                    error!(
                        service_key = key,
                        module_id, "service key already registered to another module"
                    );
                    // Roll back everything inserted for this module.
                    maps.by_service_key
                        .retain(|_, owner| !Arc::ptr_eq(owner, module));
                    return Err(ErrorCode::ServiceIdAlreadyRegistered);
                }
                maps.by_service_key.insert(key, Arc::clone(module));
                debug!(service_key = key, module_id, "indexed service key");
            }

            maps.by_module_id.insert(module_id, Arc::clone(module));

            info!(
                module_id,
                class = module.class_name(),
                keys = service_keys.len(),
                "registered module"
            );
        }

        // Bind egress to the router, outside the maps lock.
        let router = Arc::downgrade(self);
        module.set_client_send_callback(Arc::new(move |frame: Bytes| {
            if let Some(router) = router.upgrade() {
                if let Err(code) = router.route_rpc_request(frame) {
                    warn!(?code, "failed to route outbound request");
                }
            }
        }));
        let router = Arc::downgrade(self);
        module.set_server_send_callback(Arc::new(move |_client_id, frame: Bytes| {
            if let Some(router) = router.upgrade() {
                if let Err(code) = router.route_rpc_response(frame) {
                    warn!(?code, "failed to route outbound response");
                }
            }
        }));

        Ok(())
    }

    /// Remove every index entry pointing at this module. Deregistering an
    /// unregistered module is a no-op returning success.
    pub fn deregister(&self, module: &Arc<ModuleHost>) -> Result<(), ErrorCode> {
        let mut maps = self.lock_maps();
        maps.by_service_key
            .retain(|_, owner| !Arc::ptr_eq(owner, module));
        maps.by_module_id.remove(&module.module_id());
        if let Some(network) = &maps.network_module {
            if Arc::ptr_eq(network, module) {
                maps.network_module = None;
            }
        }
        info!(module_id = module.module_id(), "deregistered module");
        Ok(())
    }

    /// Entry point for frames arriving from the network boundary. The kind
    /// bit in the header decides the routing path; the caller is not
    /// trusted to know it.
    pub fn route_protocol_packet(&self, frame: Bytes) -> Result<(), ErrorCode> {
        let (header, event) = event_for_frame(frame)?;
        self.route_event(header.kind, header.service_key, header.client_id, event)
    }

    /// Route a request frame to the module owning its service key.
    pub fn route_rpc_request(&self, frame: Bytes) -> Result<(), ErrorCode> {
        let (header, event) = event_for_frame(frame)?;
        if header.kind != FrameKind::Request {
            return Err(ErrorCode::InvalidArguments);
        }
        self.route_event(header.kind, header.service_key, header.client_id, event)
    }

    /// Route a response frame back to the calling module (by client id).
    pub fn route_rpc_response(&self, frame: Bytes) -> Result<(), ErrorCode> {
        let (header, event) = event_for_frame(frame)?;
        if header.kind != FrameKind::Response {
            return Err(ErrorCode::InvalidArguments);
        }
        self.route_event(header.kind, header.service_key, header.client_id, event)
    }

    fn route_event(
        &self,
        kind: FrameKind,
        service_key: ServiceKey,
        client_id: u64,
        event: ModuleEvent,
    ) -> Result<(), ErrorCode> {
        if service_key == 0 || client_id == 0 {
            return Err(ErrorCode::InvalidArguments);
        }

        // Resolve under the lock, deliver after it is released.
        let (target, via_network) = {
            let maps = self.lock_maps();
            let local = match kind {
                FrameKind::Request => maps.by_service_key.get(&service_key).cloned(),
                FrameKind::Response => maps.by_module_id.get(&(client_id as ModuleId)).cloned(),
            };
            match local {
                Some(module) => (Some(module), false),
                None => (maps.network_module.clone(), true),
            }
        };

        let Some(target) = target else {
            error!(?kind, service_key, client_id, "no module and no network fallback");
            return Err(ErrorCode::ServiceIdNotFound);
        };

        if via_network {
            debug!(
                ?kind,
                service_key, client_id, "no local module, falling back to network egress"
            );
        }
        target.push_event(event)
    }

    /// Invoke `do_post_init` on every registered module. The first failure
    /// becomes the aggregate result; all modules are still visited.
    pub fn post_all_init(&self) -> Result<(), ErrorCode> {
        let modules: Vec<Arc<ModuleHost>> =
            self.lock_maps().by_module_id.values().cloned().collect();

        let ctx = PostInitContext {
            roster: modules
                .iter()
                .map(|module| ModuleDescriptor {
                    module_id: module.module_id(),
                    class_name: module.class_name().to_string(),
                    service_keys: module.service_keys(),
                })
                .collect(),
        };

        let mut first_error = Ok(());
        for module in &modules {
            if let Err(code) = module.post_init(&ctx) {
                error!(
                    module_id = module.module_id(),
                    class = module.class_name(),
                    ?code,
                    "post_init failed"
                );
                if first_error.is_ok() {
                    first_error = Err(code);
                }
            }
        }
        first_error
    }

    /// Number of indexed service keys (diagnostics and tests).
    pub fn service_key_count(&self) -> usize {
        self.lock_maps().by_service_key.len()
    }

    /// Owner of a service key, if registered.
    pub fn module_for_key(&self, key: ServiceKey) -> Option<Arc<ModuleHost>> {
        self.lock_maps().by_service_key.get(&key).cloned()
    }

    /// Look up a registered module by id.
    pub fn module_by_id(&self, id: ModuleId) -> Option<Arc<ModuleHost>> {
        self.lock_maps().by_module_id.get(&id).cloned()
    }

    fn lock_maps(&self) -> std::sync::MutexGuard<'_, RouterMaps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }
}
