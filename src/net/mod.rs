//! Network boundary
//!
//! The minimal transport contract the core consumes: asynchronous accept
//! and connect identified by caller-chosen opaques, send/close by
//! connection id, and a callback set for delivery events. Exactly one of
//! `on_connected` / `on_connect_failed` fires per connect attempt.

pub mod module;
pub mod tcp;

pub use module::NetworkModule;
pub use tcp::TcpBoundary;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::ErrorCode;
use crate::ConnId;

/// Listen socket is bound: `(opaque, ip, port)`.
pub type BoundFn = Arc<dyn Fn(u64, &str, u16) + Send + Sync>;

/// Inbound connection accepted: `(listener opaque, conn_id)`.
pub type AcceptedFn = Arc<dyn Fn(u64, ConnId) + Send + Sync>;

/// Outbound connect succeeded: `(opaque, conn_id)`.
pub type ConnectedFn = Arc<dyn Fn(u64, ConnId) + Send + Sync>;

/// Outbound connect failed: `(opaque, error)`.
pub type ConnectFailedFn = Arc<dyn Fn(u64, ErrorCode) + Send + Sync>;

/// A complete frame arrived on a connection.
pub type ReceivedFn = Arc<dyn Fn(ConnId, Bytes) + Send + Sync>;

/// A connection closed (peer hangup, error, or local close).
pub type ClosedFn = Arc<dyn Fn(ConnId) + Send + Sync>;

/// Delivery callbacks. Invoked from transport worker tasks; implementations
/// must be thread-safe and must not block.
#[derive(Clone, Default)]
pub struct TransportCallbacks {
    pub on_bound: Option<BoundFn>,
    pub on_accepted: Option<AcceptedFn>,
    pub on_connected: Option<ConnectedFn>,
    pub on_connect_failed: Option<ConnectFailedFn>,
    pub on_received: Option<ReceivedFn>,
    pub on_close: Option<ClosedFn>,
}

/// Transport capability consumed by the network module and cluster router.
pub trait NetworkBoundary: Send + Sync {
    /// Install the callback set; call before `start`.
    fn set_callbacks(&self, callbacks: TransportCallbacks);

    /// Start worker processing. Listen requests queued by `accept` are
    /// bound now.
    fn start(&self, worker_threads: usize) -> Result<(), ErrorCode>;

    /// Request a listen socket. May be called before `start`.
    fn accept(&self, opaque: u64, ip: &str, port: u16) -> Result<(), ErrorCode>;

    /// Initiate an asynchronous connect.
    fn connect(&self, opaque: u64, host: &str, port: u16) -> Result<(), ErrorCode>;

    /// Queue a frame for transmission.
    fn send(&self, conn_id: ConnId, frame: Bytes) -> Result<(), ErrorCode>;

    /// Close a connection; `on_close` fires for it.
    fn close(&self, conn_id: ConnId);

    /// Driven by the container's main loop; most transports need nothing.
    fn tick(&self) {}
}
