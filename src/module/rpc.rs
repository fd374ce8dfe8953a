//! Client side of the coroutine RPC
//!
//! `call` builds a request frame, hands it to the bound egress callback and
//! suspends on a oneshot keyed by the frame's correlation id. The mailbox
//! drain that sees the matching response resumes the future. A timeout
//! resolves the future with `Timeout` and evicts the correlation entry; the
//! in-flight transport send is not cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::sync::Arc;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::frame::{self, FrameHeader, FrameKind};
use crate::module::traits::{ClientSendFn, HandlerResult};
use crate::{ClientId, ModuleId, ServiceKey};

/// Default RPC deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-module RPC client: correlation table plus the egress callback bound
/// by the router at registration.
pub struct RpcClient {
    module_id: ModuleId,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<HandlerResult>>>,
    send: RwLock<Option<ClientSendFn>>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(module_id: ModuleId) -> Self {
        Self::with_timeout(module_id, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(module_id: ModuleId, timeout: Duration) -> Self {
        RpcClient {
            module_id,
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            send: RwLock::new(None),
            timeout,
        }
    }

    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    pub(crate) fn set_send_callback(&self, callback: ClientSendFn) {
        *self.send.write().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Call the handler registered under `service_key`, suspending until the
    /// response arrives or the deadline elapses.
    pub async fn call(&self, service_key: ServiceKey, payload: Bytes) -> HandlerResult {
        let send = self
            .send
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ErrorCode::SetSendCallbackFailed)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(seq, tx);
        }

        let request = frame::request_frame(service_key, self.module_id as ClientId, seq, &payload);
        // Egress runs outside every lock.
        send(request);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without a response (module shutting down).
                Err(ErrorCode::Timeout)
            }
            Err(_) => {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(&seq);
                warn!(
                    module_id = self.module_id,
                    service_key, seq, "rpc call timed out"
                );
                Err(ErrorCode::Timeout)
            }
        }
    }

    /// Resume the pending future matching the response's correlation id.
    /// Called from the owning module's mailbox drain.
    pub(crate) fn on_response(&self, response: Bytes) {
        let header = match FrameHeader::parse(&response) {
            Ok(header) if header.kind == FrameKind::Response => header,
            Ok(_) => {
                warn!(module_id = self.module_id, "request frame in response path");
                return;
            }
            Err(_) => {
                warn!(module_id = self.module_id, "unparseable response frame");
                return;
            }
        };

        let sender = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&header.seq)
        };
        let Some(sender) = sender else {
            debug!(
                module_id = self.module_id,
                seq = header.seq,
                "no pending call for response (timed out or duplicate)"
            );
            return;
        };

        let result = match header.error() {
            Some(code) => Err(code),
            None => Ok(frame::frame_payload(&response)),
        };
        let _ = sender.send(result);
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn call_without_callback_fails_fast() {
        let rpc = RpcClient::new(7);
        let result = rpc.call(101, Bytes::new()).await;
        assert_eq!(result, Err(ErrorCode::SetSendCallbackFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_and_evicts_pending_entry() {
        let rpc = Arc::new(RpcClient::with_timeout(7, std::time::Duration::from_millis(50)));
        rpc.set_send_callback(Arc::new(|_frame| {
            // Swallow the frame: no response will ever arrive.
        }));
        let result = rpc.call(101, Bytes::from_static(b"x")).await;
        assert_eq!(result, Err(ErrorCode::Timeout));
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn response_resumes_matching_call() {
        let rpc = Arc::new(RpcClient::new(9));
        let sent: Arc<StdMutex<Vec<Bytes>>> = Arc::new(StdMutex::new(Vec::new()));
        let captured = Arc::clone(&sent);
        rpc.set_send_callback(Arc::new(move |frame| {
            captured.lock().unwrap().push(frame);
        }));

        let caller = Arc::clone(&rpc);
        let call = tokio::spawn(async move { caller.call(202, Bytes::from_static(b"ping")).await });

        // Wait for the request frame to surface, then answer it.
        let request = loop {
            if let Some(frame) = sent.lock().unwrap().first().cloned() {
                break frame;
            }
            tokio::task::yield_now().await;
        };
        let header = FrameHeader::parse(&request).unwrap();
        assert_eq!(header.service_key, 202);
        assert_eq!(header.client_id, 9);

        let response =
            frame::response_frame(header.service_key, header.client_id, header.seq, b"pong");
        rpc.on_response(response);

        let result = call.await.unwrap().unwrap();
        assert_eq!(result.as_ref(), b"pong");
        assert_eq!(rpc.pending_calls(), 0);
    }
}
