//! Shutdown signal wiring.
//!
//! SIGINT / SIGTERM only record the signal number and write one byte to a
//! self-pipe. `Server::run` registers the pipe's read end with its broker,
//! so a signal that lands between the `pending()` check and the wait still
//! wakes the reactor. Handlers are installed without `SA_RESTART`.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static PENDING: AtomicI32 = AtomicI32::new(0);
static WAKE_READ: AtomicI32 = AtomicI32::new(-1);
static WAKE_WRITE: AtomicI32 = AtomicI32::new(-1);
static WAKE_INIT: Once = Once::new();

/// Serializes tests that touch the process-wide signal state.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

extern "C" fn record_signal(sig: libc::c_int) {
    PENDING.store(sig, Ordering::SeqCst);
    let fd = WAKE_WRITE.load(Ordering::SeqCst);
    if fd >= 0 {
        // async-signal-safe; a full pipe already guarantees a wakeup
        let byte = 1u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn set_flags(fd: RawFd) -> nix::Result<()> {
    unsafe {
        let fl = Errno::result(libc::fcntl(fd, libc::F_GETFL))?;
        Errno::result(libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK))?;
        Errno::result(libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    }
    Ok(())
}

/// Create the self-pipe once. Both ends are non-blocking.
fn init_wakeup() -> nix::Result<()> {
    let mut result = Ok(());
    WAKE_INIT.call_once(|| {
        let mut fds = [-1 as libc::c_int; 2];
        result = Errno::result(unsafe { libc::pipe(fds.as_mut_ptr()) })
            .and_then(|_| set_flags(fds[0]))
            .and_then(|_| set_flags(fds[1]));
        if result.is_ok() {
            WAKE_READ.store(fds[0], Ordering::SeqCst);
            WAKE_WRITE.store(fds[1], Ordering::SeqCst);
        }
    });
    result
}

pub fn install() -> nix::Result<()> {
    init_wakeup()?;
    let stop = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGINT, &stop)?;
        sigaction(Signal::SIGTERM, &stop)?;
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Read end of the self-pipe, once `install()` has run.
pub fn wakeup_fd() -> Option<RawFd> {
    match WAKE_READ.load(Ordering::SeqCst) {
        fd if fd >= 0 => Some(fd),
        _ => None,
    }
}

/// Empty the self-pipe after it polled readable.
pub fn drain_wakeup() -> io::Result<()> {
    let fd = match wakeup_fd() {
        Some(fd) => fd,
        None => return Ok(()),
    };
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            continue;
        }
        if n == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(()),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err),
        }
    }
}

/// Take the last recorded signal, if any.
pub fn pending() -> Option<i32> {
    match PENDING.swap(0, Ordering::SeqCst) {
        0 => None,
        sig => Some(sig),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, 0) == 1 }
    }

    #[test]
    fn handler_records_and_wakes() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_wakeup().unwrap();
        let fd = wakeup_fd().unwrap();
        drain_wakeup().unwrap();
        pending();

        record_signal(libc::SIGTERM);
        assert!(readable(fd));
        assert_eq!(pending(), Some(libc::SIGTERM));
        assert_eq!(pending(), None);

        drain_wakeup().unwrap();
        assert!(!readable(fd));
    }
}
