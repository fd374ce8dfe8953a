//! Bounded SPSC mailbox
//!
//! Fixed-capacity ring of owned events, one per module. Push and pop are
//! wait-free; a push against a full mailbox fails without blocking and the
//! recovery policy (drain-once-and-retry) lives at the module level.
//!
//! Discipline: at most one producer and one consumer at any instant. The
//! roles may migrate between threads as long as successive producers (or
//! consumers) are externally serialized with proper synchronization - the
//! router's delivery lock and the module host's inner lock provide exactly
//! that.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default mailbox capacity in events.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256 * 1024;

/// Single-producer single-consumer bounded queue of owned values.
pub struct Mailbox<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    /// Next slot to pop; owned by the consumer.
    head: AtomicUsize,
    /// Next slot to push; owned by the producer.
    tail: AtomicUsize,
}

// Values are moved in and out whole; the atomics order slot access.
unsafe impl<T: Send> Send for Mailbox<T> {}
unsafe impl<T: Send> Sync for Mailbox<T> {}

impl<T> Mailbox<T> {
    /// Create a mailbox holding up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "mailbox capacity must be non-zero");
        // One extra slot distinguishes full from empty.
        let slots = (0..capacity + 1)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Mailbox {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Number of events the mailbox can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Enqueue an event, returning it unchanged if the mailbox is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % self.slots.len();
        if next == self.head.load(Ordering::Acquire) {
            return Err(value);
        }
        unsafe {
            *self.slots[tail].get() = Some(value);
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Dequeue the oldest event, transferring ownership to the consumer.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*self.slots[head].get()).take() };
        self.head.store((head + 1) % self.slots.len(), Ordering::Release);
        value
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        (tail + 1) % self.slots.len() == self.head.load(Ordering::Acquire)
    }

    /// Current number of queued events.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.slots.len() - head) % self.slots.len()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Mailbox::new(DEFAULT_MAILBOX_CAPACITY)
    }
}
