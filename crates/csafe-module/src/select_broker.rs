//! `SelectBroker` — fallback `EventBroker` implementation over `select(2)`.
//!
//! Rebuilds the fd sets on every wait from an ordered registration map.
//! Descriptors at or above `FD_SETSIZE` cannot be represented and are
//! refused at registration time.

use csafe_core::broker::{EventBroker, Interest, Readiness};

use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct SelectBroker {
    interests: BTreeMap<RawFd, Interest>,
}

impl SelectBroker {
    pub fn new() -> Self {
        Self {
            interests: BTreeMap::new(),
        }
    }
}

impl Default for SelectBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_set() -> libc::fd_set {
    let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe { libc::FD_ZERO(&mut set) };
    set
}

impl EventBroker for SelectBroker {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fd {} outside select() range", fd),
            ));
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) {
        self.interests.remove(&fd);
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<()> {
        out.clear();
        let mut read_set = empty_set();
        let mut write_set = empty_set();
        let mut except_set = empty_set();
        let mut max_fd = -1;

        for (&fd, interest) in &self.interests {
            unsafe {
                if interest.readable {
                    libc::FD_SET(fd, &mut read_set);
                }
                if interest.writable {
                    libc::FD_SET(fd, &mut write_set);
                }
                libc::FD_SET(fd, &mut except_set);
            }
            max_fd = max_fd.max(fd);
        }

        let mut tv;
        let tv_ptr = match timeout {
            None => std::ptr::null_mut(),
            Some(d) => {
                tv = libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: d.subsec_micros() as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
        };

        let ret = unsafe {
            libc::select(max_fd + 1, &mut read_set, &mut write_set, &mut except_set, tv_ptr)
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

        for &fd in self.interests.keys() {
            let (readable, writable, error) = unsafe {
                (
                    libc::FD_ISSET(fd, &read_set),
                    libc::FD_ISSET(fd, &write_set),
                    libc::FD_ISSET(fd, &except_set),
                )
            };
            if readable || writable || error {
                out.push(Readiness { fd, readable, writable, error });
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.interests.len()
    }

    fn name(&self) -> &'static str {
        "select"
    }
}
