//! TCP implementation of the network boundary
//!
//! Each connection gets a reader task (header-then-payload frame loop) and
//! a writer task fed by an unbounded channel, so sends never block the
//! caller. Connects carry a 10-second timeout to avoid hanging on
//! unresponsive peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ErrorCode;
use crate::frame::{FrameHeader, HEADER_LEN, MAX_FRAME_PAYLOAD};
use crate::net::{NetworkBoundary, TransportCallbacks};
use crate::ConnId;

const CONNECT_TIMEOUT_SECS: u64 = 10;

struct ConnHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    reader: Option<JoinHandle<()>>,
}

struct Shared {
    callbacks: RwLock<TransportCallbacks>,
    conns: Mutex<HashMap<ConnId, ConnHandle>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    pending_listens: Mutex<Vec<(u64, String, u16)>>,
}

impl Shared {
    fn callbacks(&self) -> TransportCallbacks {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn remove_conn(&self, conn_id: ConnId) -> Option<ConnHandle> {
        self.conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn_id)
    }
}

/// Tokio TCP transport.
pub struct TcpBoundary {
    shared: Arc<Shared>,
}

impl TcpBoundary {
    pub fn new() -> Arc<Self> {
        Arc::new(TcpBoundary {
            shared: Arc::new(Shared {
                callbacks: RwLock::new(TransportCallbacks::default()),
                conns: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
                started: AtomicBool::new(false),
                pending_listens: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared
            .conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl NetworkBoundary for TcpBoundary {
    fn set_callbacks(&self, callbacks: TransportCallbacks) {
        *self
            .shared
            .callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner()) = callbacks;
    }

    fn start(&self, worker_threads: usize) -> Result<(), ErrorCode> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Scheduling rides the shared runtime; the thread count is recorded
        // for operators reading the logs.
        info!(worker_threads, "tcp boundary started");
        let pending: Vec<(u64, String, u16)> = self
            .shared
            .pending_listens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for (opaque, ip, port) in pending {
            spawn_listener(Arc::clone(&self.shared), opaque, ip, port);
        }
        Ok(())
    }

    fn accept(&self, opaque: u64, ip: &str, port: u16) -> Result<(), ErrorCode> {
        if self.shared.started.load(Ordering::SeqCst) {
            spawn_listener(Arc::clone(&self.shared), opaque, ip.to_string(), port);
        } else {
            self.shared
                .pending_listens
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((opaque, ip.to_string(), port));
        }
        Ok(())
    }

    fn connect(&self, opaque: u64, host: &str, port: u16) -> Result<(), ErrorCode> {
        if !self.shared.started.load(Ordering::SeqCst) {
            return Err(ErrorCode::NetworkStartFailed);
        }
        let shared = Arc::clone(&self.shared);
        let host = host.to_string();
        tokio::spawn(async move {
            let attempt = tokio::time::timeout(
                std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS),
                TcpStream::connect((host.as_str(), port)),
            )
            .await;

            match attempt {
                Ok(Ok(stream)) => {
                    let conn_id = register_connection(&shared, stream);
                    debug!(opaque, conn_id, host = %host, port, "connected");
                    if let Some(on_connected) = shared.callbacks().on_connected {
                        on_connected(opaque, conn_id);
                    }
                }
                Ok(Err(err)) => {
                    warn!(opaque, host = %host, port, %err, "connect failed");
                    if let Some(on_failed) = shared.callbacks().on_connect_failed {
                        on_failed(opaque, ErrorCode::NetworkStartFailed);
                    }
                }
                Err(_) => {
                    warn!(opaque, host = %host, port, "connect timed out");
                    if let Some(on_failed) = shared.callbacks().on_connect_failed {
                        on_failed(opaque, ErrorCode::Timeout);
                    }
                }
            }
        });
        Ok(())
    }

    fn send(&self, conn_id: ConnId, frame: Bytes) -> Result<(), ErrorCode> {
        let conns = self.shared.conns.lock().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = conns.get(&conn_id) else {
            return Err(ErrorCode::SendBufferOverflow);
        };
        handle
            .tx
            .send(frame)
            .map_err(|_| ErrorCode::SendBufferOverflow)
    }

    fn close(&self, conn_id: ConnId) {
        if let Some(handle) = self.shared.remove_conn(conn_id) {
            if let Some(reader) = &handle.reader {
                reader.abort();
            }
            // Dropping the sender ends the writer task.
            drop(handle);
            debug!(conn_id, "closed connection");
            if let Some(on_close) = self.shared.callbacks().on_close {
                on_close(conn_id);
            }
        }
    }
}

fn spawn_listener(shared: Arc<Shared>, opaque: u64, ip: String, port: u16) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind((ip.as_str(), port)).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(ip = %ip, port, %err, "failed to bind listen socket");
                return;
            }
        };
        let bound_port = listener.local_addr().map(|addr| addr.port()).unwrap_or(port);
        info!(ip = %ip, port = bound_port, "listening");
        if let Some(on_bound) = shared.callbacks().on_bound {
            on_bound(opaque, &ip, bound_port);
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let conn_id = register_connection(&shared, stream);
                    debug!(conn_id, peer = %peer, "accepted connection");
                    if let Some(on_accepted) = shared.callbacks().on_accepted {
                        on_accepted(opaque, conn_id);
                    }
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    break;
                }
            }
        }
    });
}

fn register_connection(shared: &Arc<Shared>, stream: TcpStream) -> ConnId {
    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    // Writer: drains the send queue until the sender side is dropped.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Register before the reader runs so an instantly-closing peer cannot
    // race its own cleanup.
    shared
        .conns
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(conn_id, ConnHandle { tx, reader: None });

    // Reader: header, then payload, then hand the whole frame upward.
    let reader_shared = Arc::clone(shared);
    let reader = tokio::spawn(async move {
        loop {
            let mut header_buf = [0u8; HEADER_LEN];
            if read_half.read_exact(&mut header_buf).await.is_err() {
                break;
            }
            let header = match FrameHeader::parse(&header_buf) {
                Ok(header) => header,
                Err(_) => {
                    warn!(conn_id, "garbled frame header, dropping connection");
                    break;
                }
            };
            let payload_len = header.payload_len as usize;
            if payload_len > MAX_FRAME_PAYLOAD {
                warn!(conn_id, payload_len, "oversized frame, dropping connection");
                break;
            }

            let mut frame = BytesMut::with_capacity(HEADER_LEN + payload_len);
            frame.extend_from_slice(&header_buf);
            frame.resize(HEADER_LEN + payload_len, 0);
            if read_half
                .read_exact(&mut frame[HEADER_LEN..])
                .await
                .is_err()
            {
                break;
            }

            if let Some(on_received) = reader_shared.callbacks().on_received {
                on_received(conn_id, frame.freeze());
            }
        }

        if reader_shared.remove_conn(conn_id).is_some() {
            debug!(conn_id, "connection closed by peer");
            if let Some(on_close) = reader_shared.callbacks().on_close {
                on_close(conn_id);
            }
        }
    });

    if let Some(handle) = shared
        .conns
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get_mut(&conn_id)
    {
        handle.reader = Some(reader);
    } else {
        // The peer already vanished and the reader cleaned up.
        reader.abort();
    }
    conn_id
}
