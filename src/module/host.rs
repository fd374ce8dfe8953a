//! Module host: the non-overridable half of the module contract
//!
//! Owns the mailbox, the handler map, the RPC client and the lifecycle
//! state machine for one module, and implements the container-facing
//! (`init`/`tick`/`uninit`) and router-facing (`push_event`, callback
//! binding, key enumeration) operations around the module's `do_*` hooks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::error::ErrorCode;
use crate::frame::{self, FrameHeader, FrameKind};
use crate::mailbox::{Mailbox, DEFAULT_MAILBOX_CAPACITY};
use crate::module::event::ModuleEvent;
use crate::module::router::ModuleRouter;
use crate::module::rpc::RpcClient;
use crate::module::traits::{
    ClientSendFn, HandlerFn, HandlerRegistry, LifecycleState, Module, ModuleContext,
    PostInitContext, ServerSendFn,
};
use crate::utils::{lock_unpoisoned, stable_hash32};
use crate::{ModuleId, ServiceKey};

/// Wraps a [`Module`] implementation with the base contract.
pub struct ModuleHost {
    id: ModuleId,
    class_name: String,
    is_network: bool,
    inner: Mutex<Box<dyn Module>>,
    mailbox: Mailbox<ModuleEvent>,
    handlers: HashMap<ServiceKey, HandlerFn>,
    rpc: Arc<RpcClient>,
    server_send: RwLock<Option<ServerSendFn>>,
    state: Mutex<LifecycleState>,
}

impl ModuleHost {
    /// Host a module with the default mailbox capacity.
    pub fn new(module: Box<dyn Module>) -> Arc<Self> {
        Self::with_capacity(module, DEFAULT_MAILBOX_CAPACITY)
    }

    /// Host a module with an explicit mailbox capacity.
    pub fn with_capacity(mut module: Box<dyn Module>, capacity: usize) -> Arc<Self> {
        let class_name = module.class_name().to_string();
        let id = stable_hash32(&class_name);
        let is_network = module.is_network();
        let rpc = Arc::new(RpcClient::new(id));

        // Handlers are declared before router registration so the key index
        // is complete when the router reads it.
        let mut registry = HandlerRegistry::default();
        let ctx = ModuleContext {
            module_id: id,
            rpc: Arc::clone(&rpc),
        };
        module.register_handlers(&mut registry, &ctx);

        Arc::new(ModuleHost {
            id,
            class_name,
            is_network,
            inner: Mutex::new(module),
            mailbox: Mailbox::new(capacity),
            handlers: registry.into_handlers(),
            rpc,
            server_send: RwLock::new(None),
            state: Mutex::new(LifecycleState::Unregistered),
        })
    }

    pub fn module_id(&self) -> ModuleId {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn is_network(&self) -> bool {
        self.is_network
    }

    /// Handler keys registered by this module.
    pub fn service_keys(&self) -> Vec<ServiceKey> {
        self.handlers.keys().copied().collect()
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub fn state(&self) -> LifecycleState {
        *lock_unpoisoned(&self.state)
    }

    pub fn mailbox_len(&self) -> usize {
        self.mailbox.len()
    }

    // ----- container-facing contract -----

    /// Register with the router, then run the module's own init. A
    /// registration failure returns before user init runs; an init failure
    /// leaves the module `Registered` and the container aborts startup.
    pub fn init(self: &Arc<Self>, router: &Arc<ModuleRouter>) -> Result<(), ErrorCode> {
        router.register(self, self.is_network)?;
        *lock_unpoisoned(&self.state) = LifecycleState::Registered;

        let ctx = self.context();
        lock_unpoisoned(&self.inner).do_init(&ctx)?;
        *lock_unpoisoned(&self.state) = LifecycleState::Initialized;
        Ok(())
    }

    /// Invoked by the router once every module has completed `init`.
    pub fn post_init(&self, ctx: &PostInitContext) -> Result<(), ErrorCode> {
        lock_unpoisoned(&self.inner).do_post_init(ctx)?;
        *lock_unpoisoned(&self.state) = LifecycleState::PostInit;
        Ok(())
    }

    /// Drain the mailbox, then run the module's own tick.
    pub fn tick(&self) -> Result<(), ErrorCode> {
        let mut inner = lock_unpoisoned(&self.inner);
        self.drain(inner.as_mut());
        {
            let mut state = lock_unpoisoned(&self.state);
            if matches!(*state, LifecycleState::Initialized | LifecycleState::PostInit) {
                *state = LifecycleState::Running;
            }
        }
        inner.do_tick()
    }

    /// Run the module's own uninit, then deregister. Deregistration always
    /// runs; errors from both are logged.
    pub fn uninit(self: &Arc<Self>, router: &ModuleRouter) -> Result<(), ErrorCode> {
        let result = lock_unpoisoned(&self.inner).do_uninit();
        if let Err(code) = result {
            error!(module = %self.class_name, ?code, "do_uninit failed");
        }
        if let Err(code) = router.deregister(self) {
            error!(module = %self.class_name, ?code, "deregister failed");
        }
        *lock_unpoisoned(&self.state) = LifecycleState::Uninitialized;
        result
    }

    // ----- router-facing contract -----

    /// Enqueue an event. On a full mailbox the host drains once and retries;
    /// if still full the push fails with `RecvBufferOverflow`.
    pub fn push_event(&self, event: ModuleEvent) -> Result<(), ErrorCode> {
        let Err(event) = self.mailbox.try_push(event) else {
            return Ok(());
        };
        // Drain only if the consumer seat is free and handlers can actually
        // run here; if the tick thread is already draining, the retry below
        // observes its progress.
        if tokio::runtime::Handle::try_current().is_ok() {
            match self.inner.try_lock() {
                Ok(mut inner) => self.drain(inner.as_mut()),
                Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                    self.drain(poisoned.into_inner().as_mut())
                }
                Err(std::sync::TryLockError::WouldBlock) => {}
            }
        }
        self.mailbox
            .try_push(event)
            .map_err(|_| ErrorCode::RecvBufferOverflow)
    }

    pub(crate) fn set_server_send_callback(&self, callback: ServerSendFn) {
        *self.server_send.write().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub(crate) fn set_client_send_callback(&self, callback: ClientSendFn) {
        self.rpc.set_send_callback(callback);
    }

    fn context(&self) -> ModuleContext {
        ModuleContext {
            module_id: self.id,
            rpc: Arc::clone(&self.rpc),
        }
    }

    // ----- mailbox drain -----

    fn drain(&self, module: &mut dyn Module) {
        while let Some(event) = self.mailbox.try_pop() {
            if self.is_network {
                // Egress module: events landing here left local delivery.
                if let Err(code) = module.forward_event(event) {
                    warn!(module = %self.class_name, ?code, "forward_event failed");
                }
                continue;
            }
            match event {
                ModuleEvent::RpcRequest(request) => self.dispatch_request(request),
                ModuleEvent::RpcResponse(response) => self.rpc.on_response(response),
            }
        }
    }

    /// Dispatch one request frame against the handler map. The handler runs
    /// as a task; its completion builds the response frame and hands it to
    /// the server egress callback outside every lock.
    fn dispatch_request(&self, request: Bytes) {
        let header = match FrameHeader::parse(&request) {
            Ok(header) => header,
            Err(_) => {
                warn!(module = %self.class_name, "dropping unparseable request frame");
                return;
            }
        };

        let server_send = self
            .server_send
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(server_send) = server_send else {
            warn!(module = %self.class_name, "no server send callback, dropping request");
            return;
        };

        let Some(handler) = self.handlers.get(&header.service_key) else {
            debug!(
                module = %self.class_name,
                service_key = header.service_key,
                "no handler for service key"
            );
            let reply = frame::error_response_frame(
                header.service_key,
                header.client_id,
                header.seq,
                ErrorCode::ServiceIdNotFound,
            );
            server_send(header.client_id, reply);
            return;
        };

        if tokio::runtime::Handle::try_current().is_err() {
            warn!(module = %self.class_name, "no runtime to dispatch handler, dropping request");
            return;
        }
        let future = handler(frame::frame_payload(&request));
        tokio::spawn(async move {
            let reply = match future.await {
                Ok(payload) => frame::response_frame(
                    header.service_key,
                    header.client_id,
                    header.seq,
                    &payload,
                ),
                Err(code) => frame::error_response_frame(
                    header.service_key,
                    header.client_id,
                    header.seq,
                    code,
                ),
            };
            server_send(header.client_id, reply);
        });
    }
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("id", &self.id)
            .field("class_name", &self.class_name)
            .field("is_network", &self.is_network)
            .field("state", &self.state())
            .finish()
    }
}

// Classification parsed here so response routing never trusts the caller
// path; used by the router's protocol-packet entry.
pub(crate) fn event_for_frame(frame: Bytes) -> Result<(FrameHeader, ModuleEvent), ErrorCode> {
    let header = FrameHeader::parse(&frame)?;
    let event = match header.kind {
        FrameKind::Request => ModuleEvent::RpcRequest(frame),
        FrameKind::Response => ModuleEvent::RpcResponse(frame),
    };
    Ok((header, event))
}
