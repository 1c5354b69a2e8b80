//! Objects driven by the reactor.
//!
//! A `Pollable` owns one non-blocking descriptor. The reactor registers
//! `interest()` with its `EventBroker` every iteration and calls the
//! readiness handlers. Handlers never block: partial reads / writes are
//! remembered and retried on the next readiness event.
//!
//! Pollables talk to each other only through the `Context` the reactor
//! hands them: they may `spawn()` new pollables (a block client opened on
//! behalf of a request) and `complete()` operations, which the reactor
//! routes back to the owning pollable by `Token`.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::broker::Interest;
use crate::error::BackendError;

/// Identity of a pollable inside the reactor.
///
/// Slots are reused; the generation makes a stale token (one that
/// outlived its pollable) never match the slot's new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub slot: u32,
    pub generation: u32,
}

/// Per-owner operation number. Pairs a completion with the suspension
/// that requested it.
pub type OpId = u64;

/// Raw block bytes (READ) or an empty acknowledgement (WRITE).
pub type BlockReply = Result<Vec<u8>, BackendError>;

/// The result of one block operation, addressed to the pollable that
/// issued it.
#[derive(Debug)]
pub struct Completion {
    pub owner: Token,
    pub op: OpId,
    pub reply: BlockReply,
}

/// Reactor services available to a handler for the duration of one call.
pub struct Context<'a> {
    token: Token,
    now: Instant,
    spawned: &'a mut Vec<Box<dyn Pollable>>,
    completions: &'a mut VecDeque<Completion>,
}

impl<'a> Context<'a> {
    pub fn new(
        token: Token,
        now: Instant,
        spawned: &'a mut Vec<Box<dyn Pollable>>,
        completions: &'a mut VecDeque<Completion>,
    ) -> Self {
        Self { token, now, spawned, completions }
    }

    /// Token of the pollable being called.
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Hand a new pollable to the reactor. It is registered after the
    /// current handler returns.
    pub fn spawn(&mut self, pollable: Box<dyn Pollable>) {
        self.spawned.push(pollable);
    }

    /// Queue a completion for delivery to its owner.
    pub fn complete(&mut self, completion: Completion) {
        self.completions.push_back(completion);
    }
}

/// Something the reactor multiplexes.
pub trait Pollable {
    fn fd(&self) -> RawFd;

    /// Current interest. Re-read by the reactor before every wait.
    fn interest(&self) -> Interest;

    fn on_readable(&mut self, cx: &mut Context<'_>) -> io::Result<()>;

    fn on_writable(&mut self, cx: &mut Context<'_>) -> io::Result<()>;

    /// A block operation this pollable issued has finished.
    fn on_completion(&mut self, _cx: &mut Context<'_>, _completion: Completion) -> io::Result<()> {
        Ok(())
    }

    /// The reactor is about to drop this pollable because a handler failed
    /// or it expired. Last chance to notify anyone waiting on it.
    fn on_abort(&mut self, _cx: &mut Context<'_>, _reason: &io::Error) {}

    /// Cooperative shutdown: stop taking new work, finish draining writes.
    fn on_stop(&mut self) {}

    /// Closed pollables are unregistered and dropped by the reactor.
    fn is_closed(&self) -> bool;

    /// Time of the last socket progress, for idle eviction.
    fn last_activity(&self) -> Instant;

    /// Whether idle eviction may apply right now.
    fn expirable(&self) -> bool {
        true
    }
}
