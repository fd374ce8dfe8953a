//! Module system traits and interfaces
//!
//! A concrete module implements only the `do_*` hooks; the surrounding
//! contract (registration, mailbox drain, callback binding) is provided by
//! [`crate::module::host::ModuleHost`] and is not overridable.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::error::ErrorCode;
use crate::module::event::ModuleEvent;
use crate::module::rpc::RpcClient;
use crate::{ClientId, ModuleId, ServiceKey};

/// Result of one RPC handler invocation: response payload or an error code
/// that is shipped back to the caller in the response status byte.
pub type HandlerResult = Result<Bytes, ErrorCode>;

/// Boxed future returned by a handler; handlers may suspend on outbound RPC.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// An RPC handler: request payload in, response payload out.
pub type HandlerFn = Arc<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

/// Server-side egress: a finished response frame plus the caller identity.
pub type ServerSendFn = Arc<dyn Fn(ClientId, Bytes) + Send + Sync>;

/// Client-side egress: an outbound request frame.
pub type ClientSendFn = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Collects the handlers a module exposes, keyed by service key.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ServiceKey, HandlerFn>,
}

impl HandlerRegistry {
    /// Register a handler for `key`. A later registration for the same key
    /// replaces the earlier one within this module; cross-module collisions
    /// are rejected by the router.
    pub fn register<F>(&mut self, key: ServiceKey, handler: F)
    where
        F: Fn(Bytes) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handlers.insert(key, Arc::new(handler));
    }

    pub(crate) fn into_handlers(self) -> HashMap<ServiceKey, HandlerFn> {
        self.handlers
    }
}

/// Per-module context handed to `register_handlers` and `do_init`.
#[derive(Clone)]
pub struct ModuleContext {
    pub module_id: ModuleId,
    /// Client side of the coroutine RPC: `rpc.call(key, payload).await`.
    pub rpc: Arc<RpcClient>,
}

/// Identity and handler keys of one registered module, as seen at post-init.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub module_id: ModuleId,
    pub class_name: String,
    pub service_keys: Vec<ServiceKey>,
}

/// Context for `do_post_init`: handler maps are complete by then, so this is
/// the place for cross-module wiring.
pub struct PostInitContext {
    /// Every normally-registered module, in unspecified order.
    pub roster: Vec<ModuleDescriptor>,
}

/// One-shot lifecycle of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unregistered,
    Registered,
    Initialized,
    PostInit,
    Running,
    Uninitialized,
}

/// The contract a concrete module implements.
///
/// `register_handlers` runs at host construction so that the handler keys
/// exist before the router indexes them; the remaining hooks run in
/// lifecycle order under the container.
pub trait Module: Send {
    /// Fully-qualified type name; the module id is a stable hash of it.
    fn class_name(&self) -> &str;

    /// True for the designated network egress module.
    fn is_network(&self) -> bool {
        false
    }

    /// Declare RPC handlers. Called once, before router registration.
    fn register_handlers(&mut self, _handlers: &mut HandlerRegistry, _ctx: &ModuleContext) {}

    fn do_init(&mut self, _ctx: &ModuleContext) -> Result<(), ErrorCode> {
        Ok(())
    }

    /// Called once every module has completed `do_init`.
    fn do_post_init(&mut self, _ctx: &PostInitContext) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn do_tick(&mut self) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn do_uninit(&mut self) -> Result<(), ErrorCode> {
        Ok(())
    }

    /// Egress hook for the network module: events the router could not
    /// deliver locally are handed here to be shipped across the wire.
    /// Non-network modules never see this.
    fn forward_event(&mut self, _event: ModuleEvent) -> Result<(), ErrorCode> {
        warn!(
            module = self.class_name(),
            "forward_event on a module without network egress, frame dropped"
        );
        Ok(())
    }
}
