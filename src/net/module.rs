//! Network module
//!
//! The designated egress module. Inbound frames from the boundary enter the
//! router through the ingress closure; events the router could not deliver
//! locally land in this module's mailbox and are forwarded over the uplink
//! connection (the cluster router's transport into this node).

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::module::event::ModuleEvent;
use crate::module::traits::{Module, ModuleContext};
use crate::net::{NetworkBoundary, TransportCallbacks};
use crate::ConnId;

/// Hands an inbound frame to the router (`route_protocol_packet`).
pub type IngressFn = Arc<dyn Fn(Bytes) + Send + Sync>;

pub struct NetworkModule {
    boundary: Arc<dyn NetworkBoundary>,
    ingress: IngressFn,
    listen_ip: String,
    listen_port: u16,
    worker_threads: usize,
    /// Most recent peer connection; all instances at this node share it.
    uplink: Arc<Mutex<Option<ConnId>>>,
}

impl NetworkModule {
    pub fn new(
        boundary: Arc<dyn NetworkBoundary>,
        ingress: IngressFn,
        listen_ip: String,
        listen_port: u16,
        worker_threads: usize,
    ) -> Self {
        NetworkModule {
            boundary,
            ingress,
            listen_ip,
            listen_port,
            worker_threads,
            uplink: Arc::new(Mutex::new(None)),
        }
    }

    fn uplink(&self) -> Option<ConnId> {
        *self.uplink.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Module for NetworkModule {
    fn class_name(&self) -> &str {
        "NetworkModule"
    }

    fn is_network(&self) -> bool {
        true
    }

    fn do_init(&mut self, _ctx: &ModuleContext) -> Result<(), ErrorCode> {
        let ingress = Arc::clone(&self.ingress);
        let uplink = Arc::clone(&self.uplink);
        let uplink_on_close = Arc::clone(&self.uplink);

        self.boundary.set_callbacks(TransportCallbacks {
            on_bound: Some(Arc::new(|_opaque, ip: &str, port| {
                info!(ip, port, "listen socket bound");
            })),
            on_accepted: Some(Arc::new(move |_opaque, conn_id| {
                info!(conn_id, "router peer connected");
                *uplink.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn_id);
            })),
            on_connected: None,
            on_connect_failed: None,
            on_received: Some(Arc::new(move |conn_id, frame| {
                debug!(conn_id, len = frame.len(), "inbound frame");
                ingress(frame);
            })),
            on_close: Some(Arc::new(move |conn_id| {
                let mut uplink = uplink_on_close.lock().unwrap_or_else(|e| e.into_inner());
                if *uplink == Some(conn_id) {
                    warn!(conn_id, "router peer disconnected");
                    *uplink = None;
                }
            })),
        });

        self.boundary.accept(0, &self.listen_ip, self.listen_port)?;
        self.boundary
            .start(self.worker_threads)
            .map_err(|_| ErrorCode::NetworkStartFailed)?;
        info!(
            ip = %self.listen_ip,
            port = self.listen_port,
            "network module started"
        );
        Ok(())
    }

    fn do_tick(&mut self) -> Result<(), ErrorCode> {
        self.boundary.tick();
        Ok(())
    }

    fn do_uninit(&mut self) -> Result<(), ErrorCode> {
        if let Some(conn_id) = self.uplink() {
            self.boundary.close(conn_id);
        }
        info!("network module stopped");
        Ok(())
    }

    /// Cross-node egress: ship the raw frame to the router peer.
    fn forward_event(&mut self, event: ModuleEvent) -> Result<(), ErrorCode> {
        let Some(conn_id) = self.uplink() else {
            warn!("no router peer connected, dropping undeliverable frame");
            return Err(ErrorCode::ServiceIdNotFound);
        };
        self.boundary.send(conn_id, event.into_frame())
    }
}
