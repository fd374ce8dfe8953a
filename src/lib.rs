//! BaseNode - runtime core of a distributed application node
//!
//! A node is composed of independently packaged modules loaded at startup.
//! Modules expose RPC handlers identified by numeric keys and communicate
//! through an in-process frame router; cross-node traffic is forwarded by a
//! dedicated cluster-router process that discovers peers through a
//! coordination service.
//!
//! ## Architecture
//!
//! 1. `mailbox` - bounded SPSC event queue, one per module
//! 2. `module` - module lifecycle contract, frame router, container
//! 3. `discovery` - coordination-backed service registry and discovery
//! 4. `net` - network boundary (transport capability + TCP implementation)
//! 5. `cluster` - the cluster-router module forwarding frames between nodes
//! 6. `config` - multi-format configuration loading with `$ref` resolution

pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod mailbox;
pub mod module;
pub mod net;
pub mod node;
pub mod utils;

pub use error::ErrorCode;

/// Stable 32-bit module identifier, derived by hashing the module class name.
pub type ModuleId = u32;

/// 32-bit identifier of one RPC handler, unique across a node.
pub type ServiceKey = u32;

/// 64-bit caller identity carried in request frames (the caller's
/// [`ModuleId`], zero-padded). Responses are steered by this value.
pub type ClientId = u64;

/// Transport connection identifier assigned by the network boundary.
pub type ConnId = u64;

/// Stable 64-bit identifier of a service instance in the coordination tree.
pub type InstanceId = u64;
