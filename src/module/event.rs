//! Module events
//!
//! Events are owned values moved through mailboxes; the frame bytes inside
//! them are owned too, so nothing borrowed survives an enqueue.

use bytes::Bytes;

/// A tagged event delivered to a module's mailbox.
#[derive(Debug, Clone)]
pub enum ModuleEvent {
    /// A complete request frame (header + payload).
    RpcRequest(Bytes),
    /// A complete response frame (header + payload).
    RpcResponse(Bytes),
}

impl ModuleEvent {
    /// The raw frame bytes, regardless of kind.
    pub fn into_frame(self) -> Bytes {
        match self {
            ModuleEvent::RpcRequest(frame) | ModuleEvent::RpcResponse(frame) => frame,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, ModuleEvent::RpcRequest(_))
    }
}
