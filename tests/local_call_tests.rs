//! End-to-end local RPC: two modules calling each other through the router

use std::sync::{Arc, Mutex};
use std::time::Duration;

use basenode::module::host::ModuleHost;
use basenode::module::router::ModuleRouter;
use basenode::module::traits::{HandlerRegistry, Module, ModuleContext};
use basenode::ErrorCode;
use bytes::Bytes;

// Module A: pure caller, key 101 unused by the scenario.
struct CallerModule;

impl Module for CallerModule {
    fn class_name(&self) -> &str {
        "CallerModule"
    }

    fn register_handlers(&mut self, handlers: &mut HandlerRegistry, _ctx: &ModuleContext) {
        handlers.register(101, |payload| Box::pin(async move { Ok(payload) }));
    }
}

// Module B: answers key 202 with "pong" (and records what it saw), fails
// key 203 deliberately.
struct ServerModule {
    received: Arc<Mutex<Vec<Bytes>>>,
}

impl Module for ServerModule {
    fn class_name(&self) -> &str {
        "ServerModule"
    }

    fn register_handlers(&mut self, handlers: &mut HandlerRegistry, _ctx: &ModuleContext) {
        let received = Arc::clone(&self.received);
        handlers.register(202, move |payload| {
            let received = Arc::clone(&received);
            Box::pin(async move {
                received.lock().unwrap().push(payload.clone());
                if payload.as_ref() == b"ping" {
                    Ok(Bytes::from_static(b"pong"))
                } else {
                    Ok(Bytes::new())
                }
            })
        });
        handlers.register(203, |_payload| {
            Box::pin(async move { Err(ErrorCode::InvalidArguments) })
        });
    }
}

struct Nodes {
    // Held for its lifetime: modules only keep a `Weak` back-reference to
    // the router, so this must outlive the test or routing goes silently
    // dead.
    router: Arc<ModuleRouter>,
    caller: Arc<ModuleHost>,
    server: Arc<ModuleHost>,
    received: Arc<Mutex<Vec<Bytes>>>,
}

fn setup() -> Nodes {
    let router = ModuleRouter::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let caller = ModuleHost::new(Box::new(CallerModule));
    let server = ModuleHost::new(Box::new(ServerModule {
        received: Arc::clone(&received),
    }));
    caller.init(&router).unwrap();
    server.init(&router).unwrap();
    Nodes {
        router,
        caller,
        server,
        received,
    }
}

// Drive both modules' ticks until the call task finishes.
async fn run_until_done<T>(nodes: &Nodes, call: tokio::task::JoinHandle<T>) -> T {
    for _ in 0..500 {
        nodes.caller.tick().unwrap();
        nodes.server.tick().unwrap();
        if call.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    call.await.expect("call task panicked")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_call_round_trips_ping_pong() {
    let nodes = setup();

    let rpc = Arc::clone(nodes.caller.rpc());
    let call = tokio::spawn(async move { rpc.call(202, Bytes::from_static(b"ping")).await });
    let result = run_until_done(&nodes, call).await;

    assert_eq!(result.unwrap().as_ref(), b"pong");
    // The server saw exactly the request payload.
    let received = nodes.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].as_ref(), b"ping");
    assert_eq!(nodes.caller.rpc().pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_error_is_shipped_back_as_a_status() {
    let nodes = setup();

    let rpc = Arc::clone(nodes.caller.rpc());
    let call = tokio::spawn(async move { rpc.call(203, Bytes::from_static(b"x")).await });
    let result = run_until_done(&nodes, call).await;

    assert_eq!(result, Err(ErrorCode::InvalidArguments));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_ping_payload_gets_an_empty_reply() {
    let nodes = setup();

    let rpc = Arc::clone(nodes.caller.rpc());
    let call = tokio::spawn(async move { rpc.call(202, Bytes::from_static(b"other")).await });
    let result = run_until_done(&nodes, call).await;
    assert_eq!(result.unwrap().as_ref(), b"");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_concurrent_calls_resolve_independently() {
    let nodes = setup();

    let rpc_one = Arc::clone(nodes.caller.rpc());
    let first = tokio::spawn(async move { rpc_one.call(202, Bytes::from_static(b"ping")).await });
    let rpc_two = Arc::clone(nodes.caller.rpc());
    let second = tokio::spawn(async move { rpc_two.call(202, Bytes::from_static(b"ping")).await });

    let first = run_until_done(&nodes, first).await;
    let second = run_until_done(&nodes, second).await;
    assert_eq!(first.unwrap().as_ref(), b"pong");
    assert_eq!(second.unwrap().as_ref(), b"pong");
    assert_eq!(nodes.received.lock().unwrap().len(), 2);
}
