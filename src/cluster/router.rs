//! Cluster router module
//!
//! Runs as the only module of a dedicated router process. After post-init
//! it discovers every node instance, keeps exactly one transport per
//! `host:port` (shared by all instances at that address) and forwards
//! frames between nodes without deserializing RPC bodies. Each forwarded
//! request is stamped with a router-assigned request id; the response comes
//! back carrying that id, and the request-context table maps it to the
//! origin connection and the caller's original correlation id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::discovery::{InstanceChangeCallback, ServiceDiscovery, ServiceInstance};
use crate::error::ErrorCode;
use crate::frame::{self, FrameHeader, FrameKind};
use crate::module::traits::{Module, ModuleContext, PostInitContext};
use crate::net::{NetworkBoundary, TransportCallbacks};
use crate::{ConnId, InstanceId, ServiceKey};

/// Context recorded per forwarded request so the response can be returned
/// to the connection it came from, with the caller's own correlation id
/// restored.
struct PendingRequest {
    origin_conn: ConnId,
    seq: u64,
}

/// Shared routing state, reachable from transport and watch callbacks.
pub struct ClusterState {
    boundary: Arc<dyn NetworkBoundary>,
    /// Every instance currently known, keyed by instance id.
    key_to_instance: Mutex<HashMap<InstanceId, ServiceInstance>>,
    /// In-flight connects: opaque -> (host, port).
    pending_connections: Mutex<HashMap<u64, (String, u16)>>,
    next_opaque: AtomicU64,
    /// Outstanding forwarded requests, keyed by the router-assigned request
    /// id stamped into the forwarded frame's correlation field. The caller's
    /// `(client_id, seq)` is not unique across origin connections - module
    /// ids are class-name hashes and every client counts from 1 - so the
    /// router mints its own id and translates on the way back.
    request_contexts: Mutex<HashMap<u64, PendingRequest>>,
    next_request_id: AtomicU64,
}

impl ClusterState {
    fn new(boundary: Arc<dyn NetworkBoundary>) -> Arc<Self> {
        Arc::new(ClusterState {
            boundary,
            key_to_instance: Mutex::new(HashMap::new()),
            pending_connections: Mutex::new(HashMap::new()),
            next_opaque: AtomicU64::new(0),
            request_contexts: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
        })
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ----- connection bookkeeping -----

    fn connection_for_address(&self, host: &str, port: u16) -> ConnId {
        self.lock(&self.key_to_instance)
            .values()
            .find(|instance| instance.host == host && instance.port == port)
            .map(|instance| instance.connection_id)
            .unwrap_or(0)
    }

    fn connect_pending_for(&self, host: &str, port: u16) -> bool {
        self.lock(&self.pending_connections)
            .values()
            .any(|(pending_host, pending_port)| pending_host == host && *pending_port == port)
    }

    /// Annotate every recorded instance at `host:port` with `conn_id`;
    /// returns how many instances now share the connection.
    fn set_connection_id(&self, host: &str, port: u16, conn_id: ConnId) -> usize {
        let mut instances = self.lock(&self.key_to_instance);
        let mut count = 0;
        for instance in instances.values_mut() {
            if instance.host == host && instance.port == port {
                instance.connection_id = conn_id;
                instance.healthy = true;
                count += 1;
            }
        }
        count
    }

    fn instances_on_connection(&self, conn_id: ConnId) -> Vec<InstanceId> {
        self.lock(&self.key_to_instance)
            .iter()
            .filter(|(_, instance)| instance.connection_id == conn_id)
            .map(|(id, _)| *id)
            .collect()
    }

    // ----- transport callbacks -----

    fn on_connected(&self, opaque: u64, conn_id: ConnId) {
        let Some((host, port)) = self.lock(&self.pending_connections).remove(&opaque) else {
            warn!(opaque, conn_id, "connected with no pending record");
            return;
        };
        let shared = self.set_connection_id(&host, port, conn_id);
        info!(
            host = %host,
            port,
            conn_id,
            instances = shared,
            "connected, one transport shared by all instances at this address"
        );
    }

    fn on_connect_failed(&self, opaque: u64, code: ErrorCode) {
        let pending = self.lock(&self.pending_connections).remove(&opaque);
        error!(opaque, ?code, ?pending, "connect failed");
    }

    fn on_close(&self, conn_id: ConnId) {
        let mut instances = self.lock(&self.key_to_instance);
        let before = instances.len();
        instances.retain(|_, instance| instance.connection_id != conn_id);
        info!(
            conn_id,
            removed = before - instances.len(),
            "connection closed, instances forgotten"
        );
    }

    /// Link-layer forwarding: requests route by service key, responses by
    /// the stored request context.
    fn on_received(&self, conn_id: ConnId, frame: Bytes) {
        let header = match FrameHeader::parse(&frame) {
            Ok(header) => header,
            Err(_) => {
                warn!(conn_id, "unparseable frame, dropped");
                return;
            }
        };
        if header.service_key == 0 || header.client_id == 0 {
            warn!(conn_id, "frame without service key or client id, dropped");
            return;
        }

        match header.kind {
            FrameKind::Request => self.forward_request(conn_id, header, frame),
            FrameKind::Response => self.forward_response(conn_id, header, frame),
        }
    }

    fn forward_request(&self, source_conn: ConnId, header: FrameHeader, frame: Bytes) {
        let target_conn = self.connection_for_service(header.service_key);
        if target_conn == 0 {
            error!(
                service_key = header.service_key,
                "no route for service key, request dropped"
            );
            return;
        }

        // Remember the requester under a fresh request id and stamp that id
        // into the forwarded frame; the target echoes it in its response.
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock(&self.request_contexts).insert(
            request_id,
            PendingRequest {
                origin_conn: source_conn,
                seq: header.seq,
            },
        );

        let outbound = frame::with_seq(&frame, request_id);
        if let Err(code) = self.boundary.send(target_conn, outbound) {
            error!(target_conn, ?code, "failed to forward request");
            self.lock(&self.request_contexts).remove(&request_id);
            return;
        }
        debug!(
            service_key = header.service_key,
            seq = header.seq,
            request_id,
            source_conn,
            target_conn,
            "request forwarded"
        );
    }

    fn forward_response(&self, response_conn: ConnId, header: FrameHeader, frame: Bytes) {
        // The response's correlation field carries the router's request id.
        let Some(context) = self.lock(&self.request_contexts).remove(&header.seq) else {
            warn!(
                request_id = header.seq,
                response_conn, "response without request context, dropped"
            );
            return;
        };

        let restored = frame::with_seq(&frame, context.seq);
        if let Err(code) = self.boundary.send(context.origin_conn, restored) {
            error!(
                origin_conn = context.origin_conn,
                ?code,
                "failed to forward response"
            );
            return;
        }
        debug!(
            request_id = header.seq,
            seq = context.seq,
            response_conn,
            origin_conn = context.origin_conn,
            "response forwarded"
        );
    }

    fn connection_for_service(&self, service_key: ServiceKey) -> ConnId {
        let wanted = service_key.to_string();
        self.lock(&self.key_to_instance)
            .values()
            .find(|instance| {
                instance.healthy && instance.connection_id != 0 && instance.service_name == wanted
            })
            .map(|instance| instance.connection_id)
            .unwrap_or(0)
    }

    // ----- instance change handling -----

    fn on_instances_changed(&self, service_name: &str, instances: &[ServiceInstance]) {
        info!(
            service = service_name,
            instances = instances.len(),
            "service instances changed"
        );

        let current_ids: HashSet<InstanceId> = instances
            .iter()
            .filter(|instance| instance.healthy)
            .map(|instance| instance.instance_id)
            .collect();

        // Forget (and disconnect, when last user) everything that vanished.
        let stale: Vec<ServiceInstance> = self
            .lock(&self.key_to_instance)
            .values()
            .filter(|instance| !current_ids.contains(&instance.instance_id))
            .cloned()
            .collect();
        for instance in stale {
            self.disconnect_instance(&instance);
        }

        for instance in instances {
            if !instance.healthy {
                debug!(instance = %instance.serialize(), "skipping unhealthy instance");
                continue;
            }

            let existing = self
                .lock(&self.key_to_instance)
                .get(&instance.instance_id)
                .cloned();
            match existing {
                None => self.connect_instance(instance),
                Some(existing) if existing.connection_id == 0 => {
                    self.connect_instance(instance);
                }
                Some(existing)
                    if existing.host == instance.host && existing.port == instance.port =>
                {
                    debug!(instance = %instance.serialize(), "already connected");
                }
                Some(existing) => {
                    // Same id at a new address: replace.
                    info!(
                        old = %existing.address(),
                        new = %instance.address(),
                        "instance moved, reconnecting"
                    );
                    self.disconnect_instance(&existing);
                    self.connect_instance(instance);
                }
            }
        }
    }

    /// Connection reuse: an established transport to the address is shared,
    /// a pending connect is joined, otherwise a fresh connect starts.
    fn connect_instance(&self, instance: &ServiceInstance) {
        let host = instance.host.clone();
        let port = instance.port;

        let existing_conn = self.connection_for_address(&host, port);
        if existing_conn != 0 {
            let mut annotated = instance.clone();
            annotated.connection_id = existing_conn;
            annotated.healthy = true;
            self.lock(&self.key_to_instance)
                .insert(instance.instance_id, annotated);
            debug!(
                instance_id = instance.instance_id,
                conn_id = existing_conn,
                "reusing established connection"
            );
            return;
        }

        if self.connect_pending_for(&host, port) {
            self.lock(&self.key_to_instance)
                .insert(instance.instance_id, instance.clone());
            debug!(
                instance_id = instance.instance_id,
                host = %host,
                port,
                "connect already pending, instance recorded"
            );
            return;
        }

        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock(&self.pending_connections)
            .insert(opaque, (host.clone(), port));
        self.lock(&self.key_to_instance)
            .insert(instance.instance_id, instance.clone());
        info!(host = %host, port, opaque, "connecting (one connection per address)");
        if let Err(code) = self.boundary.connect(opaque, &host, port) {
            error!(host = %host, port, ?code, "connect dispatch failed");
            self.lock(&self.pending_connections).remove(&opaque);
        }
    }

    /// Forget an instance; close its connection when no other current
    /// instance still uses it.
    fn disconnect_instance(&self, instance: &ServiceInstance) {
        let conn_id = instance.connection_id;
        self.lock(&self.key_to_instance)
            .remove(&instance.instance_id);
        if conn_id == 0 {
            return;
        }
        let still_used = !self.instances_on_connection(conn_id).is_empty();
        if still_used {
            debug!(conn_id, "connection still shared, left open");
            return;
        }
        info!(conn_id, address = %instance.address(), "closing connection");
        self.boundary.close(conn_id);
    }

    // ----- test / diagnostic views -----

    pub fn instance_count(&self) -> usize {
        self.lock(&self.key_to_instance).len()
    }

    pub fn pending_connection_count(&self) -> usize {
        self.lock(&self.pending_connections).len()
    }

    pub fn instance(&self, id: InstanceId) -> Option<ServiceInstance> {
        self.lock(&self.key_to_instance).get(&id).cloned()
    }

    pub fn open_request_contexts(&self) -> usize {
        self.lock(&self.request_contexts).len()
    }
}

/// The router process's single module.
pub struct ClusterRouterModule {
    boundary: Arc<dyn NetworkBoundary>,
    discovery: Arc<ServiceDiscovery>,
    state: Arc<ClusterState>,
    worker_threads: usize,
}

impl ClusterRouterModule {
    pub fn new(
        boundary: Arc<dyn NetworkBoundary>,
        discovery: Arc<ServiceDiscovery>,
        worker_threads: usize,
    ) -> Self {
        let state = ClusterState::new(Arc::clone(&boundary));
        ClusterRouterModule {
            boundary,
            discovery,
            state,
            worker_threads,
        }
    }

    /// Routing state, shared with callbacks (and visible to tests).
    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }
}

impl Module for ClusterRouterModule {
    fn class_name(&self) -> &str {
        "ClusterRouterModule"
    }

    fn do_init(&mut self, _ctx: &ModuleContext) -> Result<(), ErrorCode> {
        // Transport wiring waits for post-init so every module is loaded.
        Ok(())
    }

    fn do_post_init(&mut self, _ctx: &PostInitContext) -> Result<(), ErrorCode> {
        let state = Arc::clone(&self.state);
        let on_connected = Arc::clone(&state);
        let on_failed = Arc::clone(&state);
        let on_close = Arc::clone(&state);
        let on_received = Arc::clone(&state);
        self.boundary.set_callbacks(TransportCallbacks {
            on_bound: None,
            on_accepted: None,
            on_connected: Some(Arc::new(move |opaque, conn_id| {
                on_connected.on_connected(opaque, conn_id);
            })),
            on_connect_failed: Some(Arc::new(move |opaque, code| {
                on_failed.on_connect_failed(opaque, code);
            })),
            on_received: Some(Arc::new(move |conn_id, frame| {
                on_received.on_received(conn_id, frame);
            })),
            on_close: Some(Arc::new(move |conn_id| {
                on_close.on_close(conn_id);
            })),
        });
        self.boundary.start(self.worker_threads)?;

        // Seed from the full tree, then watch it for changes.
        let services_root = self.discovery.services_root();
        let seed = self.discovery.get_service_instances(&services_root);
        info!(instances = seed.len(), "discovered service instances");

        // The watch fires once immediately with the seed list.
        let watch_state = Arc::clone(&self.state);
        let on_change: InstanceChangeCallback =
            Arc::new(move |service_name: &str, instances: &[ServiceInstance]| {
                watch_state.on_instances_changed(service_name, instances);
            });
        self.discovery
            .watch_service_instances(&services_root, &seed, on_change);

        // Newly registered services show up through the directory watch.
        let directory_state = Arc::clone(&self.state);
        self.discovery.watch_services_directory(Arc::new(
            move |service_name: &str, instances: &[ServiceInstance]| {
                directory_state.on_instances_changed(service_name, instances);
            },
        ));

        info!("cluster router ready");
        Ok(())
    }

    fn do_tick(&mut self) -> Result<(), ErrorCode> {
        self.boundary.tick();
        Ok(())
    }

    fn do_uninit(&mut self) -> Result<(), ErrorCode> {
        let instances: Vec<ServiceInstance> = {
            let map = self.state.lock(&self.state.key_to_instance);
            map.values().cloned().collect()
        };
        for instance in instances {
            self.state.disconnect_instance(&instance);
        }
        self.state.lock(&self.state.request_contexts).clear();
        self.state.lock(&self.state.pending_connections).clear();
        info!("cluster router stopped");
        Ok(())
    }
}
