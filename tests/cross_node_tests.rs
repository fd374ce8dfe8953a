//! Cross-node path over a real TCP boundary: a router peer connects to the
//! node, sends a request frame, and the response travels back over the
//! uplink - including the egress fallback for responses addressed to a
//! module this node does not host.

use std::sync::Arc;
use std::time::Duration;

use basenode::frame::{self, FrameHeader, FrameKind, HEADER_LEN};
use basenode::module::host::ModuleHost;
use basenode::module::router::ModuleRouter;
use basenode::module::traits::{HandlerRegistry, Module, ModuleContext};
use basenode::net::{NetworkModule, TcpBoundary};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct GuildModule;

impl Module for GuildModule {
    fn class_name(&self) -> &str {
        "GuildModule"
    }

    fn register_handlers(&mut self, handlers: &mut HandlerRegistry, _ctx: &ModuleContext) {
        handlers.register(303, |payload| {
            Box::pin(async move {
                assert_eq!(payload.as_ref(), b"ping");
                Ok(Bytes::from_static(b"pong"))
            })
        });
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn read_frame(stream: &mut TcpStream) -> Bytes {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let parsed = FrameHeader::parse(&header).unwrap();
    let mut payload = vec![0u8; parsed.payload_len as usize];
    stream.read_exact(&mut payload).await.unwrap();
    let mut frame = header.to_vec();
    frame.extend_from_slice(&payload);
    Bytes::from(frame)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inbound_request_is_answered_over_the_uplink() {
    let port = free_port();
    let router = ModuleRouter::new();

    // The node: one business module plus the network egress module.
    let guild = ModuleHost::new(Box::new(GuildModule));
    guild.init(&router).unwrap();

    let boundary = TcpBoundary::new();
    let ingress_router = Arc::downgrade(&router);
    let network = ModuleHost::new(Box::new(NetworkModule::new(
        boundary,
        Arc::new(move |frame: Bytes| {
            if let Some(router) = ingress_router.upgrade() {
                let _ = router.route_protocol_packet(frame);
            }
        }),
        "127.0.0.1".to_string(),
        port,
        1,
    )));
    network.init(&router).unwrap();

    // Tick loop standing in for the container.
    let ticker = {
        let guild = Arc::clone(&guild);
        let network = Arc::clone(&network);
        tokio::spawn(async move {
            loop {
                guild.tick().unwrap();
                network.tick().unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    // Give the listener a moment to bind, then connect as the router peer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // A request for key 303 from a module that lives on another node.
    let remote_caller = 0x7777_0001u64;
    let request = frame::request_frame(303, remote_caller, 5, b"ping");
    peer.write_all(&request).await.unwrap();
    peer.flush().await.unwrap();

    // The handler runs locally; the response's client id names no local
    // module, so it falls back to the network module and leaves on the
    // uplink - this connection.
    let response = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut peer))
        .await
        .expect("no response over the uplink");
    let header = FrameHeader::parse(&response).unwrap();
    assert_eq!(header.kind, FrameKind::Response);
    assert_eq!(header.service_key, 303);
    assert_eq!(header.client_id, remote_caller);
    assert_eq!(header.seq, 5);
    assert_eq!(frame::frame_payload(&response).as_ref(), b"pong");

    ticker.abort();
}
