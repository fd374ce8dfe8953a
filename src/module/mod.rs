//! Module system: lifecycle contract, event routing, container
//!
//! Every unit of application code is a module with a stable id, a mailbox of
//! owned events, and a map of RPC handlers. The router steers frames between
//! module mailboxes; the container drives lifecycle and the tick loop.

pub mod container;
pub mod event;
pub mod host;
pub mod router;
pub mod rpc;
pub mod traits;

pub use container::{ModuleContainer, ModuleFactories, DEFAULT_TICK_INTERVAL};
pub use event::ModuleEvent;
pub use host::ModuleHost;
pub use router::ModuleRouter;
pub use rpc::{RpcClient, DEFAULT_RPC_TIMEOUT};
pub use traits::{
    HandlerFn, HandlerFuture, HandlerRegistry, HandlerResult, LifecycleState, Module,
    ModuleContext, ModuleDescriptor, PostInitContext,
};
