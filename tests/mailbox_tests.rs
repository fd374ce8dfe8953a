//! Tests for the SPSC mailbox and module-level overflow behavior

use basenode::frame;
use basenode::mailbox::{Mailbox, DEFAULT_MAILBOX_CAPACITY};
use basenode::module::event::ModuleEvent;
use basenode::module::host::ModuleHost;
use basenode::module::traits::Module;
use basenode::ErrorCode;
use bytes::Bytes;

struct IdleModule;

impl Module for IdleModule {
    fn class_name(&self) -> &str {
        "IdleModule"
    }
}

// ===== Ring invariants =====

#[test]
fn fifo_order_is_preserved() {
    let mailbox = Mailbox::new(1000);
    for i in 0..1000u32 {
        mailbox.try_push(i).unwrap();
    }
    for i in 0..1000u32 {
        assert_eq!(mailbox.try_pop(), Some(i));
    }
}

#[test]
fn default_capacity_is_262144() {
    let mailbox: Mailbox<u8> = Mailbox::default();
    assert_eq!(mailbox.capacity(), 262_144);
    assert_eq!(DEFAULT_MAILBOX_CAPACITY, 262_144);
}

#[test]
fn len_tracks_push_and_pop() {
    let mailbox = Mailbox::new(8);
    assert!(mailbox.is_empty());
    mailbox.try_push(1).unwrap();
    mailbox.try_push(2).unwrap();
    assert_eq!(mailbox.len(), 2);
    mailbox.try_pop();
    assert_eq!(mailbox.len(), 1);
}

// ===== Module-level overflow =====

#[test]
fn mailbox_overflow_fails_the_262145th_push() {
    // No runtime here: the host cannot drain from the producer side, so the
    // push either fits or overflows.
    let host = ModuleHost::new(Box::new(IdleModule));
    let request = ModuleEvent::RpcRequest(frame::request_frame(101, 1, 1, b"x"));

    for i in 0..262_144 {
        assert_eq!(host.push_event(request.clone()), Ok(()), "push {i} failed");
    }
    assert_eq!(
        host.push_event(request),
        Err(ErrorCode::RecvBufferOverflow)
    );
    assert_eq!(host.mailbox_len(), 262_144);
}

#[test]
fn events_carry_owned_bytes() {
    let payload = Bytes::from(vec![1u8, 2, 3]);
    let event = ModuleEvent::RpcRequest(frame::request_frame(7, 1, 1, &payload));
    drop(payload);
    assert!(event.is_request());
    assert!(event.into_frame().len() > 3);
}
