//! Raw socket setup.
//!
//! Sockets are created with libc so listener options and non-blocking
//! connect are explicit, then handed to std types for I/O.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, RawFd};

/// Listen backlog. Connections deferred by admission control wait here.
pub const LISTEN_BACKLOG: libc::c_int = 128;

fn socket_type() -> libc::c_int {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC
        } else {
            libc::SOCK_STREAM
        }
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Closes the descriptor unless released.
struct FdGuard(RawFd);

impl FdGuard {
    fn release(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn new_socket(addr: &SocketAddr) -> io::Result<FdGuard> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = cvt(unsafe { libc::socket(family, socket_type(), 0) })?;
    Ok(FdGuard(fd))
}

pub fn resolve(address: &str, port: u16) -> io::Result<SocketAddr> {
    (address, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{}:{} resolves to nothing", address, port),
        )
    })
}

/// Bind a non-blocking listener with `SO_REUSEADDR`.
pub fn bind_listener(addr: &SocketAddr) -> io::Result<TcpListener> {
    let fd = new_socket(addr)?;
    let opt: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd.0,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            mem::size_of_val(&opt) as libc::socklen_t,
        )
    })?;
    let (storage, len) = sockaddr(addr);
    cvt(unsafe { libc::bind(fd.0, &storage as *const _ as *const libc::sockaddr, len) })?;
    cvt(unsafe { libc::listen(fd.0, LISTEN_BACKLOG) })?;

    let listener = unsafe { TcpListener::from_raw_fd(fd.release()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Start a non-blocking connect. Completion is observed as writability;
/// check `TcpStream::take_error()` then.
pub fn connect_nonblocking(addr: &SocketAddr) -> io::Result<TcpStream> {
    let fd = new_socket(addr)?;
    let flags = cvt(unsafe { libc::fcntl(fd.0, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd.0, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;

    let (storage, len) = sockaddr(addr);
    let ret = unsafe { libc::connect(fd.0, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    let stream = unsafe { TcpStream::from_raw_fd(fd.release()) };
    stream.set_nodelay(true)?;
    Ok(stream)
}
