//! `PollBroker` — default `EventBroker` implementation.
//!
//! Keeps a dense `pollfd` array plus an fd → index map so that
//! registration updates are O(1) and `wait()` hands the array straight to
//! `poll(2)`.

use csafe_core::broker::{EventBroker, Interest, Readiness};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        // Peer shutdown of its write side wakes readers too.
        const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLRDHUP;
    } else {
        const READ_EVENTS: libc::c_short = libc::POLLIN;
    }
}

const ERROR_EVENTS: libc::c_short = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

pub struct PollBroker {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
}

impl PollBroker {
    pub fn new() -> Self {
        Self {
            fds: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn events_for(interest: Interest) -> libc::c_short {
        let mut events = 0;
        if interest.readable {
            events |= READ_EVENTS;
        }
        if interest.writable {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl Default for PollBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds for `poll(2)`, rounding up so a short timeout never spins.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl EventBroker for PollBroker {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let events = Self::events_for(interest);
        match self.index.get(&fd) {
            Some(&i) => self.fds[i].events = events,
            None => {
                self.index.insert(fd, self.fds.len());
                self.fds.push(libc::pollfd { fd, events, revents: 0 });
            }
        }
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) {
        if let Some(i) = self.index.remove(&fd) {
            self.fds.swap_remove(i);
            if let Some(moved) = self.fds.get(i) {
                self.index.insert(moved.fd, i);
            }
        }
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<()> {
        out.clear();
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(());
        }
        for pfd in self.fds.iter_mut() {
            let revents = pfd.revents;
            pfd.revents = 0;
            if revents == 0 {
                continue;
            }
            out.push(Readiness {
                fd: pfd.fd,
                readable: revents & READ_EVENTS != 0,
                writable: revents & libc::POLLOUT != 0,
                error: revents & ERROR_EVENTS != 0,
            });
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}
