//! Tests for module registration, frame classification and delivery policy

use std::sync::Arc;

use basenode::frame;
use basenode::module::host::ModuleHost;
use basenode::module::router::ModuleRouter;
use basenode::module::traits::{HandlerRegistry, Module, ModuleContext};
use basenode::{ClientId, ErrorCode, ServiceKey};
use bytes::Bytes;

// Test module exposing a fixed set of echo handlers.
struct KeyedModule {
    name: String,
    keys: Vec<ServiceKey>,
}

impl KeyedModule {
    fn new(name: &str, keys: &[ServiceKey]) -> Box<Self> {
        Box::new(KeyedModule {
            name: name.to_string(),
            keys: keys.to_vec(),
        })
    }
}

impl Module for KeyedModule {
    fn class_name(&self) -> &str {
        &self.name
    }

    fn register_handlers(&mut self, handlers: &mut HandlerRegistry, _ctx: &ModuleContext) {
        for &key in &self.keys {
            handlers.register(key, |payload| Box::pin(async move { Ok(payload) }));
        }
    }
}

struct EgressModule;

impl Module for EgressModule {
    fn class_name(&self) -> &str {
        "EgressModule"
    }

    fn is_network(&self) -> bool {
        true
    }
}

fn request(key: ServiceKey, client_id: ClientId) -> Bytes {
    frame::request_frame(key, client_id, 1, b"payload")
}

fn response(key: ServiceKey, client_id: ClientId) -> Bytes {
    frame::response_frame(key, client_id, 1, b"payload")
}

// ===== Registration =====

#[test]
fn collision_rolls_back_every_inserted_key() {
    let router = ModuleRouter::new();
    let x = ModuleHost::new(KeyedModule::new("ModuleX", &[7, 8]));
    let y = ModuleHost::new(KeyedModule::new("ModuleY", &[8, 9]));

    assert_eq!(router.register(&x, false), Ok(()));
    assert_eq!(
        router.register(&y, false),
        Err(ErrorCode::ServiceIdAlreadyRegistered)
    );

    // by_service_key holds exactly {7 -> X, 8 -> X}; no trace of 9.
    assert_eq!(router.service_key_count(), 2);
    assert_eq!(
        router.module_for_key(7).unwrap().module_id(),
        x.module_id()
    );
    assert_eq!(
        router.module_for_key(8).unwrap().module_id(),
        x.module_id()
    );
    assert!(router.module_for_key(9).is_none());
}

#[test]
fn duplicate_module_id_is_rejected() {
    let router = ModuleRouter::new();
    let first = ModuleHost::new(KeyedModule::new("SameName", &[1]));
    let second = ModuleHost::new(KeyedModule::new("SameName", &[2]));

    assert_eq!(router.register(&first, false), Ok(()));
    assert_eq!(
        router.register(&second, false),
        Err(ErrorCode::ModuleAlreadyRegistered)
    );
}

#[test]
fn deregistering_an_unregistered_module_is_a_noop_success() {
    let router = ModuleRouter::new();
    let module = ModuleHost::new(KeyedModule::new("NeverRegistered", &[5]));
    assert_eq!(router.deregister(&module), Ok(()));
}

#[test]
fn deregister_removes_every_key_of_the_module() {
    let router = ModuleRouter::new();
    let module = ModuleHost::new(KeyedModule::new("Transient", &[11, 12, 13]));
    router.register(&module, false).unwrap();
    assert_eq!(router.service_key_count(), 3);

    router.deregister(&module).unwrap();
    assert_eq!(router.service_key_count(), 0);
    assert!(router.module_by_id(module.module_id()).is_none());
}

#[test]
fn key_index_always_points_at_a_registered_owner() {
    let router = ModuleRouter::new();
    let a = ModuleHost::new(KeyedModule::new("OwnerA", &[21, 22]));
    let b = ModuleHost::new(KeyedModule::new("OwnerB", &[23]));
    router.register(&a, false).unwrap();
    router.register(&b, false).unwrap();
    router.deregister(&a).unwrap();

    for key in [21, 22, 23] {
        if let Some(owner) = router.module_for_key(key) {
            assert!(router.module_by_id(owner.module_id()).is_some());
            assert!(owner.service_keys().contains(&key));
        }
    }
    assert!(router.module_for_key(21).is_none());
    assert_eq!(
        router.module_for_key(23).unwrap().module_id(),
        b.module_id()
    );
}

// ===== Delivery policy =====

#[test]
fn request_is_delivered_by_service_key() {
    let router = ModuleRouter::new();
    let module = ModuleHost::new(KeyedModule::new("RequestTarget", &[31]));
    router.register(&module, false).unwrap();

    assert_eq!(router.route_protocol_packet(request(31, 99)), Ok(()));
    assert_eq!(module.mailbox_len(), 1);
}

#[test]
fn response_is_delivered_by_caller_identity() {
    let router = ModuleRouter::new();
    let caller = ModuleHost::new(KeyedModule::new("ResponseCaller", &[41]));
    router.register(&caller, false).unwrap();

    // The response's service key points nowhere; only the client id counts.
    let frame = response(555, caller.module_id() as ClientId);
    assert_eq!(router.route_protocol_packet(frame), Ok(()));
    assert_eq!(caller.mailbox_len(), 1);
}

#[test]
fn unknown_key_without_network_module_is_an_error() {
    let router = ModuleRouter::new();
    assert_eq!(
        router.route_protocol_packet(request(404, 1)),
        Err(ErrorCode::ServiceIdNotFound)
    );
}

#[test]
fn unknown_key_falls_back_to_the_network_module() {
    let router = ModuleRouter::new();
    let egress = ModuleHost::new(Box::new(EgressModule));
    router.register(&egress, true).unwrap();

    assert_eq!(router.route_protocol_packet(request(404, 1)), Ok(()));
    assert_eq!(egress.mailbox_len(), 1);

    // Responses for unknown callers take the same fallback.
    assert_eq!(router.route_protocol_packet(response(1, 0xDEAD)), Ok(()));
    assert_eq!(egress.mailbox_len(), 2);
}

#[test]
fn zero_key_or_client_id_is_invalid() {
    let router = ModuleRouter::new();
    assert_eq!(
        router.route_protocol_packet(request(0, 1)),
        Err(ErrorCode::InvalidArguments)
    );
    assert_eq!(
        router.route_protocol_packet(request(1, 0)),
        Err(ErrorCode::InvalidArguments)
    );
    assert_eq!(
        router.route_protocol_packet(Bytes::from_static(b"garbage")),
        Err(ErrorCode::InvalidArguments)
    );
}

#[test]
fn network_module_keys_are_not_indexed() {
    let router = ModuleRouter::new();
    let egress = ModuleHost::new(Box::new(EgressModule));
    router.register(&egress, true).unwrap();
    assert_eq!(router.service_key_count(), 0);
    assert!(router.module_by_id(egress.module_id()).is_none());
}

// ===== Post-init =====

struct FailingPostInit {
    name: String,
    visited: Arc<std::sync::atomic::AtomicUsize>,
}

impl Module for FailingPostInit {
    fn class_name(&self) -> &str {
        &self.name
    }

    fn do_post_init(
        &mut self,
        _ctx: &basenode::module::traits::PostInitContext,
    ) -> Result<(), ErrorCode> {
        self.visited
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(ErrorCode::InvalidArguments)
    }
}

#[test]
fn post_all_init_visits_every_module_and_returns_first_error() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let router = ModuleRouter::new();
    let visited = Arc::new(AtomicUsize::new(0));
    for name in ["PostInitA", "PostInitB"] {
        let module = ModuleHost::new(Box::new(FailingPostInit {
            name: name.to_string(),
            visited: Arc::clone(&visited),
        }));
        router.register(&module, false).unwrap();
    }

    assert_eq!(router.post_all_init(), Err(ErrorCode::InvalidArguments));
    assert_eq!(visited.load(Ordering::SeqCst), 2);
}
