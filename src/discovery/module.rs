//! Discovery module
//!
//! Container module wrapping the service registry. At post-init the handler
//! maps are complete, so it walks the roster and publishes one instance per
//! module RPC key under the node's advertised address; keyless modules get
//! a module node without service children.

use std::sync::Arc;

use tracing::{info, warn};

use crate::discovery::client::CoordinationClient;
use crate::discovery::registry::ServiceRegistry;
use crate::discovery::ServiceInstance;
use crate::error::ErrorCode;
use crate::module::traits::{Module, ModuleContext, PostInitContext};

pub struct DiscoveryModule {
    client: Arc<dyn CoordinationClient>,
    registry: Arc<ServiceRegistry>,
    advertised_host: String,
    advertised_port: u16,
    auth: Option<(String, String)>,
    registered: Vec<ServiceInstance>,
}

impl DiscoveryModule {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        registry: Arc<ServiceRegistry>,
        advertised_host: String,
        advertised_port: u16,
        auth: Option<(String, String)>,
    ) -> Self {
        DiscoveryModule {
            client,
            registry,
            advertised_host,
            advertised_port,
            auth,
            registered: Vec::new(),
        }
    }
}

impl Module for DiscoveryModule {
    fn class_name(&self) -> &str {
        "DiscoveryModule"
    }

    fn do_init(&mut self, _ctx: &ModuleContext) -> Result<(), ErrorCode> {
        if let Some((username, password)) = &self.auth {
            if !self.client.add_auth(username, password) {
                warn!("coordination auth rejected");
            }
        }
        self.registry.init()
    }

    fn do_post_init(&mut self, ctx: &PostInitContext) -> Result<(), ErrorCode> {
        let address = format!("{}:{}", self.advertised_host, self.advertised_port);
        for descriptor in &ctx.roster {
            if descriptor.service_keys.is_empty() {
                self.registry
                    .register_module(&address, &descriptor.class_name);
                continue;
            }
            for &key in &descriptor.service_keys {
                let instance = ServiceInstance::new(
                    &key.to_string(),
                    &descriptor.class_name,
                    &self.advertised_host,
                    self.advertised_port,
                );
                if self.registry.register_service(&instance) {
                    self.registered.push(instance);
                } else {
                    warn!(
                        service_key = key,
                        module = %descriptor.class_name,
                        "failed to publish service instance"
                    );
                }
            }
        }
        info!(
            address = %address,
            instances = self.registered.len(),
            "published node services"
        );
        Ok(())
    }

    fn do_uninit(&mut self) -> Result<(), ErrorCode> {
        for instance in self.registered.drain(..) {
            self.registry.deregister_service(&instance);
        }
        self.registry.shutdown();
        Ok(())
    }
}
