//! One-shot fan-out of reorganization and transaction-pool events (spec
//! §4.16).
//!
//! The teacher fans events out over a `tokio::sync::broadcast` channel in
//! `websocket.rs`, but broadcast is multi-shot and durable — exactly the
//! wrong contract for "every subscriber is called exactly once, and must
//! re-subscribe during its own invocation to keep hearing about the
//! next one". Built fresh instead, in the teacher's plain
//! lock-guarded-`Vec` style (see `websocket.rs`'s `EventBroadcaster`
//! holding its client list behind a `Mutex`).

use crate::types::{Block, Hash32};
use std::sync::Mutex;

/// `(fork_height, incoming, outgoing)` — incoming is the newly-adopted
/// branch, oldest first; outgoing is the rolled-back confirmed suffix,
/// oldest first.
#[derive(Clone)]
pub struct ReorganizeEvent {
    pub fork_height: u32,
    pub incoming: Vec<Block>,
    pub outgoing: Vec<Block>,
}

/// A transaction accepted into (or evicted from) the mempool's view, by
/// hash — the policy layer itself is out of scope (spec §1).
#[derive(Clone, Copy)]
pub struct TransactionEvent {
    pub hash: Hash32,
    pub accepted: bool,
}

type ReorganizeHandler = Box<dyn FnOnce(&ReorganizeEvent) + Send>;
type TransactionHandler = Box<dyn FnOnce(&TransactionEvent) + Send>;

/// A one-shot subscription list for a single event type. `subscribe`
/// appends a handler; `notify` drains the list, invokes every handler
/// exactly once with the event, and leaves the list empty — a handler
/// that wants to keep hearing about future events must call `subscribe`
/// again from within its own invocation.
struct OneShot<H> {
    handlers: Mutex<Vec<H>>,
}

impl<H> Default for OneShot<H> {
    fn default() -> Self {
        OneShot { handlers: Mutex::new(Vec::new()) }
    }
}

impl<H> OneShot<H> {
    fn push(&self, handler: H) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Takes the current handler list, dropping the lock before the
    /// caller invokes them — a handler re-subscribing during its own
    /// invocation must not deadlock against this same mutex.
    fn take(&self) -> Vec<H> {
        std::mem::take(&mut *self.handlers.lock().unwrap())
    }
}

/// Registries for the two event kinds the organizer/mempool raise. A
/// dedicated strand (the organizer's writer strand, in practice) is
/// responsible for calling `notify_reorganize`/`notify_transaction` in
/// the order those events occur relative to writes, per spec §5.
#[derive(Default)]
pub struct Subscribers {
    reorganize: OneShot<ReorganizeHandler>,
    transaction: OneShot<TransactionHandler>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_reorganize(&self, handler: impl FnOnce(&ReorganizeEvent) + Send + 'static) {
        self.reorganize.push(Box::new(handler));
    }

    pub fn subscribe_transaction(&self, handler: impl FnOnce(&TransactionEvent) + Send + 'static) {
        self.transaction.push(Box::new(handler));
    }

    pub fn notify_reorganize(&self, event: &ReorganizeEvent) {
        for handler in self.reorganize.take() {
            handler(event);
        }
    }

    pub fn notify_transaction(&self, event: &TransactionEvent) {
        for handler in self.transaction.take() {
            handler(event);
        }
    }
}
