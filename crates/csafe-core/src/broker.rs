//! Readiness multiplexing abstraction.
//!
//! An `EventBroker` tracks a set of descriptors with an interest mask and
//! reports which of them became ready. It carries no business logic.
//!
//! # Implementors
//!
//! - `PollBroker` (default on unix): `poll(2)`. No descriptor-value limit.
//! - `SelectBroker` (fallback): `select(2)`. Universally available, limited
//!   to descriptors below `FD_SETSIZE`.
//!
//! Both must be behaviorally equivalent to the reactor: same registration
//! semantics, same readiness reporting, same timeout semantics.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// What the caller wants to hear about for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { readable: false, writable: false };
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };

    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// One ready descriptor reported by `wait()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up condition. Handlers should attempt a read to
    /// observe the concrete error / EOF.
    pub error: bool,
}

/// Readiness multiplexing over a set of descriptors.
///
/// **Contract:**
/// - `register()` is an upsert: registering a known descriptor replaces
///   its interest. `Interest::NONE` keeps the descriptor known but quiet
///   (error / hang-up may still be reported).
/// - `unregister()` of an unknown descriptor is a no-op.
/// - `wait(None)` blocks until at least one event; `wait(Some(d))` returns
///   after at most `d` with possibly no events.
/// - An interrupted wait (`EINTR`) returns `Ok` with no events so that the
///   caller can observe signal flags.
pub trait EventBroker {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    fn unregister(&mut self, fd: RawFd);

    /// Wait for readiness. Clears `out` and fills it with ready descriptors.
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<()>;

    /// Number of registered descriptors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable strategy name, for logs.
    fn name(&self) -> &'static str;
}

impl<B: EventBroker + ?Sized> EventBroker for Box<B> {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        (**self).register(fd, interest)
    }

    fn unregister(&mut self, fd: RawFd) {
        (**self).unregister(fd)
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<()> {
        (**self).wait(timeout, out)
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
