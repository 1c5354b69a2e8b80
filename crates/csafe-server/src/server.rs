//! `Server` — the single-threaded reactor.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use csafe_core::broker::{EventBroker, Interest, Readiness};
use csafe_core::config::ServerConfig;
use csafe_core::pollable::{Completion, Context, Pollable, Token};
use csafe_module::admission::Admission;
use csafe_module::new_broker;
use tracing::{debug, info, warn};

use crate::connection::ConnectionFactory;
use crate::net;
use crate::signal;
use crate::slab::Slab;

struct Listener {
    listener: TcpListener,
    addr: SocketAddr,
    factory: ConnectionFactory,
    armed: bool,
}

struct Entry {
    pollable: Box<dyn Pollable>,
    fd: RawFd,
    /// Holds an admission slot (accepted connection).
    admitted: bool,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Listener(usize),
    Pollable(Token),
    /// Signal self-pipe.
    Wakeup,
}

pub struct Server {
    poll_timeout: Option<Duration>,
    idle_timeout: Duration,
    broker: Box<dyn EventBroker>,
    listeners: Vec<Listener>,
    entries: Slab<Entry>,
    targets: HashMap<RawFd, Target>,
    admission: Admission,
    completions: VecDeque<Completion>,
    spawned: Vec<Box<dyn Pollable>>,
    events: Vec<Readiness>,
    stopping: bool,
    last_housekeeping: Instant,
}

impl Server {
    pub fn new(config: &ServerConfig) -> Self {
        let broker = new_broker(config.event_method);
        info!(
            broker = broker.name(),
            max_connections = config.max_connections,
            poll_timeout_ms = config.poll_timeout_ms,
            "server created"
        );
        Self {
            poll_timeout: config.poll_timeout(),
            idle_timeout: config.idle_timeout(),
            broker,
            listeners: Vec::new(),
            entries: Slab::with_capacity(config.max_connections * 2),
            targets: HashMap::new(),
            admission: Admission::new(config.max_connections),
            completions: VecDeque::new(),
            spawned: Vec::new(),
            events: Vec::new(),
            stopping: false,
            last_housekeeping: Instant::now(),
        }
    }

    /// Bind a passive socket whose connections are built by `factory`.
    /// Returns the bound address (useful with port 0).
    pub fn add_listener(
        &mut self,
        address: &str,
        port: u16,
        factory: ConnectionFactory,
    ) -> io::Result<SocketAddr> {
        let listener = net::bind_listener(&net::resolve(address, port)?)?;
        let addr = listener.local_addr()?;
        let fd = listener.as_raw_fd();
        self.targets.insert(fd, Target::Listener(self.listeners.len()));
        self.listeners.push(Listener {
            listener,
            addr,
            factory,
            armed: false,
        });
        info!(%addr, "listening");
        Ok(addr)
    }

    /// Accepted connections currently holding an admission slot.
    pub fn active_connections(&self) -> usize {
        self.admission.active()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Begin cooperative shutdown: stop accepting, tell every pollable,
    /// keep looping until in-flight responses have drained.
    pub fn stop(&mut self, signal: i32) {
        if self.stopping {
            return;
        }
        info!(signal, pollables = self.entries.len(), "stopping");
        self.stopping = true;
        for token in self.entries.tokens() {
            if let Some(entry) = self.entries.get_mut(token) {
                entry.pollable.on_stop();
            }
        }
    }

    /// Loop until stopped by a signal and drained.
    pub fn run(&mut self) -> io::Result<()> {
        if let Some(fd) = signal::wakeup_fd() {
            self.broker.register(fd, Interest::READABLE)?;
            self.targets.insert(fd, Target::Wakeup);
        }
        loop {
            if let Some(sig) = signal::pending() {
                self.stop(sig);
            }
            if !self.run_once()? {
                info!("server stopped");
                return Ok(());
            }
        }
    }

    /// One reactor iteration. Returns `false` once stopped with nothing
    /// left to drain.
    pub fn run_once(&mut self) -> io::Result<bool> {
        self.reap();
        if self.stopping && self.entries.is_empty() {
            for l in &mut self.listeners {
                if l.armed {
                    self.broker.unregister(l.listener.as_raw_fd());
                    l.armed = false;
                }
            }
            return Ok(false);
        }
        self.sync_interest();

        let mut events = std::mem::take(&mut self.events);
        self.broker.wait(self.poll_timeout, &mut events)?;
        let now = Instant::now();
        for ready in &events {
            match self.targets.get(&ready.fd).copied() {
                Some(Target::Listener(i)) => self.accept(i, now),
                Some(Target::Pollable(token)) => self.dispatch(token, ready, now),
                Some(Target::Wakeup) => {
                    if let Err(e) = signal::drain_wakeup() {
                        warn!(error = %e, "cannot drain signal pipe");
                    }
                }
                None => debug!(fd = ready.fd, "readiness for unknown fd"),
            }
            self.settle(now);
        }
        self.events = events;

        if self.poll_timeout.is_some() {
            self.housekeeping(now);
        }
        self.settle(now);
        self.reap();
        Ok(true)
    }

    /// Re-read every pollable's interest; arm listeners only while there is
    /// admission room.
    fn sync_interest(&mut self) {
        let want = !self.stopping && self.admission.has_room();
        for l in &mut self.listeners {
            let fd = l.listener.as_raw_fd();
            if want && !l.armed {
                match self.broker.register(fd, Interest::READABLE) {
                    Ok(()) => l.armed = true,
                    Err(e) => warn!(addr = %l.addr, error = %e, "cannot arm listener"),
                }
            } else if !want && l.armed {
                self.broker.unregister(fd);
                l.armed = false;
            }
        }

        let mut failed = Vec::new();
        for token in self.entries.tokens() {
            if let Some(entry) = self.entries.get(token) {
                if let Err(e) = self.broker.register(entry.fd, entry.pollable.interest()) {
                    failed.push((token, e));
                }
            }
        }
        let now = Instant::now();
        for (token, e) in failed {
            self.abort(token, &e, now);
        }
        self.settle(now);
    }

    fn accept(&mut self, index: usize, now: Instant) {
        while !self.stopping && self.admission.has_room() {
            let listener = &self.listeners[index];
            match listener.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(%peer, error = %e, "cannot make socket non-blocking");
                        continue;
                    }
                    if !self.admission.try_acquire() {
                        debug!(%peer, "admission full, dropping accepted connection");
                        return;
                    }
                    let conn = listener.factory.create(stream, peer, now);
                    let token = self.insert(Box::new(conn), true);
                    debug!(%peer, ?token, active = self.admission.active(), "accepted");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(addr = %listener.addr, error = %e, "accept failed");
                    return;
                }
            }
        }
        if !self.admission.has_room() {
            debug!(limit = self.admission.limit(), "admission full, deferring accepts");
        }
    }

    fn insert(&mut self, pollable: Box<dyn Pollable>, admitted: bool) -> Token {
        let fd = pollable.fd();
        let token = self.entries.insert(Entry { pollable, fd, admitted });
        self.targets.insert(fd, Target::Pollable(token));
        token
    }

    fn dispatch(&mut self, token: Token, ready: &Readiness, now: Instant) {
        let entry = match self.entries.get_mut(token) {
            Some(entry) => entry,
            None => return,
        };
        let mut cx = Context::new(token, now, &mut self.spawned, &mut self.completions);
        let mut result = Ok(());
        if ready.readable || ready.error {
            result = entry.pollable.on_readable(&mut cx);
        }
        if result.is_ok() && ready.writable && !entry.pollable.is_closed() {
            result = entry.pollable.on_writable(&mut cx);
        }
        if let Err(e) = result {
            self.abort(token, &e, now);
        }
    }

    /// Give a failing pollable its last word, then drop it.
    fn abort(&mut self, token: Token, reason: &io::Error, now: Instant) {
        if let Some(entry) = self.entries.get_mut(token) {
            warn!(?token, fd = entry.fd, error = %reason, "pollable aborted");
            let mut cx = Context::new(token, now, &mut self.spawned, &mut self.completions);
            entry.pollable.on_abort(&mut cx, reason);
        }
        self.remove(token);
    }

    fn remove(&mut self, token: Token) {
        if let Some(entry) = self.entries.remove(token) {
            self.broker.unregister(entry.fd);
            if matches!(self.targets.get(&entry.fd), Some(Target::Pollable(t)) if *t == token) {
                self.targets.remove(&entry.fd);
            }
            if entry.admitted {
                self.admission.release();
            }
        }
    }

    /// Adopt spawned pollables and route completions until both queues
    /// are empty.
    fn settle(&mut self, now: Instant) {
        loop {
            for pollable in std::mem::take(&mut self.spawned) {
                let token = self.insert(pollable, false);
                if self.stopping {
                    if let Some(entry) = self.entries.get_mut(token) {
                        entry.pollable.on_stop();
                    }
                }
            }
            let completion = match self.completions.pop_front() {
                Some(c) => c,
                None => break,
            };
            let owner = completion.owner;
            let entry = match self.entries.get_mut(owner) {
                Some(entry) => entry,
                None => {
                    debug!(?owner, op = completion.op, "completion for departed owner dropped");
                    continue;
                }
            };
            let mut cx = Context::new(owner, now, &mut self.spawned, &mut self.completions);
            if let Err(e) = entry.pollable.on_completion(&mut cx, completion) {
                self.abort(owner, &e, now);
            }
        }
    }

    /// Expire idle pollables. Runs at most once per poll timeout.
    fn housekeeping(&mut self, now: Instant) {
        let period = self.poll_timeout.unwrap_or_default();
        if now.duration_since(self.last_housekeeping) < period {
            return;
        }
        self.last_housekeeping = now;
        let idle: Vec<Token> = self
            .entries
            .tokens()
            .into_iter()
            .filter(|&t| {
                self.entries.get(t).map_or(false, |e| {
                    e.pollable.expirable()
                        && now.duration_since(e.pollable.last_activity()) >= self.idle_timeout
                })
            })
            .collect();
        let reason = io::Error::new(io::ErrorKind::TimedOut, "idle timeout");
        for token in idle {
            self.abort(token, &reason, now);
        }
    }

    /// Drop closed pollables and release their slots.
    fn reap(&mut self) {
        for token in self.entries.tokens() {
            if self.entries.get(token).map_or(false, |e| e.pollable.is_closed()) {
                self.remove(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{self, BlockDevice, FsSettings};
    use csafe_core::config::EventMethod;
    use csafe_core::error::HttpError;
    use csafe_core::service::{BlockIo, Produce, Progress, RequestContext, Service};
    use csafe_fs::{FileWriter, Geometry, SequentialAllocator, UserKey};
    use csafe_module::block_store::BlockStore;
    use csafe_module::device_map::DeviceMap;
    use csafe_module::registry::ServiceRegistry;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::rc::Rc;

    const BS: usize = 512;

    fn config(method: EventMethod, max_connections: usize) -> ServerConfig {
        ServerConfig::new()
            .max_connections(max_connections)
            .poll_timeout_ms(5)
            .event_method(method)
            .block_size(BS)
    }

    struct Hello {
        sent: bool,
    }

    impl Service for Hello {
        fn name(&self) -> &'static str {
            "/hello"
        }

        fn before_response_headers(
            &mut self,
            req: &mut RequestContext,
            _io: &mut dyn BlockIo,
        ) -> Result<Progress, HttpError> {
            req.set_header("Content-Length", "5");
            Ok(Progress::Ready)
        }

        fn produce_response(
            &mut self,
            _req: &mut RequestContext,
            _io: &mut dyn BlockIo,
        ) -> Result<Produce, HttpError> {
            if self.sent {
                return Ok(Produce::Done);
            }
            self.sent = true;
            Ok(Produce::Emit(b"hello".to_vec()))
        }
    }

    fn hello_factory() -> ConnectionFactory {
        let mut registry = ServiceRegistry::new();
        registry.register("/hello", || Box::new(Hello { sent: false }));
        ConnectionFactory::new(registry, DeviceMap::empty(), BS)
    }

    /// Non-blocking read of whatever is available. `true` once EOF was seen.
    fn drain(stream: &mut TcpStream, out: &mut Vec<u8>) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                // server closed with our unread request bytes still queued
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return true,
                Err(e) => panic!("client read: {}", e),
            }
        }
    }

    /// Send `request`, turn the reactor until the server closes the
    /// connection, return the raw response.
    fn roundtrip(server: &mut Server, addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(request).unwrap();
        client.set_nonblocking(true).unwrap();
        let mut out = Vec::new();
        for _ in 0..5000 {
            server.run_once().unwrap();
            if drain(&mut client, &mut out) {
                return out;
            }
        }
        panic!("no complete response; got {:?}", String::from_utf8_lossy(&out));
    }

    fn split(response: &[u8]) -> (String, Vec<u8>) {
        let end = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        (
            String::from_utf8_lossy(&response[..end]).to_string(),
            response[end + 4..].to_vec(),
        )
    }

    #[test]
    fn serves_and_closes() {
        let mut server = Server::new(&config(EventMethod::Poll, 4));
        let addr = server.add_listener("127.0.0.1", 0, hello_factory()).unwrap();
        let (head, body) = split(&roundtrip(&mut server, addr, b"GET /hello HTTP/1.1\r\n\r\n"));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: close"));
        assert_eq!(body, b"hello");
        for _ in 0..10 {
            server.run_once().unwrap();
        }
        assert_eq!(server.active_connections(), 0);
    }

    #[test]
    fn protocol_errors_answer_and_keep_serving() {
        let mut server = Server::new(&config(EventMethod::Poll, 4));
        let addr = server.add_listener("127.0.0.1", 0, hello_factory()).unwrap();

        let (head, body) = split(&roundtrip(&mut server, addr, b"GET /missing HTTP/1.1\r\n\r\n"));
        assert!(head.starts_with("HTTP/1.1 404 File Not Found"));
        assert!(String::from_utf8_lossy(&body).contains("<HTML>"));

        let (head, _) = split(&roundtrip(&mut server, addr, b"GET /hello HTTP/9\r\n\r\n"));
        assert!(head.starts_with("HTTP/1.1 500 Internal Error"));

        let mut many = b"GET /hello HTTP/1.1\r\n".to_vec();
        for i in 0..120 {
            many.extend_from_slice(format!("X{}: y\r\n", i).as_bytes());
        }
        many.extend_from_slice(b"\r\n");
        let (head, _) = split(&roundtrip(&mut server, addr, &many));
        assert!(head.starts_with("HTTP/1.1 500"));

        // oversized header block without terminator
        let huge = vec![b'a'; 2 * BS];
        let (head, _) = split(&roundtrip(&mut server, addr, &huge));
        assert!(head.starts_with("HTTP/1.1 500"));

        let (head, _) = split(&roundtrip(&mut server, addr, b"GET /hello HTTP/1.1\r\n\r\n"));
        assert!(head.starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn request_arriving_one_byte_per_turn() {
        for method in [EventMethod::Poll, EventMethod::Select] {
            let mut server = Server::new(&config(method, 4));
            let addr = server.add_listener("127.0.0.1", 0, hello_factory()).unwrap();
            let request = b"GET /hello HTTP/1.1\r\nX-Trace: abc\r\n\r\n";
            let mut client = TcpStream::connect(addr).unwrap();
            client.set_nodelay(true).unwrap();
            client.set_nonblocking(true).unwrap();

            let mut out = Vec::new();
            for (i, b) in request.iter().enumerate() {
                client.write_all(&[*b]).unwrap();
                server.run_once().unwrap();
                if i + 1 < request.len() {
                    assert!(!drain(&mut client, &mut out));
                    assert!(out.is_empty(), "answered after {} bytes", i + 1);
                }
            }
            let mut done = false;
            for _ in 0..5000 {
                server.run_once().unwrap();
                if drain(&mut client, &mut out) {
                    done = true;
                    break;
                }
            }
            assert!(done);
            let (head, body) = split(&out);
            assert!(head.starts_with("HTTP/1.1 200 OK"), "{}", head);
            assert_eq!(body, b"hello");
        }
    }

    #[test]
    fn signal_wakes_a_blocked_reactor() {
        let _guard = signal::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        signal::install().unwrap();
        // poll timeout 0: the reactor blocks with nothing else to wake it
        let mut server = Server::new(&ServerConfig::new().max_connections(2).block_size(BS));
        server.add_listener("127.0.0.1", 0, hello_factory()).unwrap();
        let killer = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(100));
            unsafe {
                libc::kill(libc::getpid(), libc::SIGTERM);
            }
        });
        server.run().unwrap();
        killer.join().unwrap();
        assert!(server.is_stopping());
    }

    #[test]
    fn admission_defers_extra_connections() {
        for method in [EventMethod::Poll, EventMethod::Select] {
            let mut server = Server::new(&config(method, 1));
            let addr = server.add_listener("127.0.0.1", 0, hello_factory()).unwrap();

            let first = TcpStream::connect(addr).unwrap();
            for _ in 0..20 {
                server.run_once().unwrap();
            }
            assert_eq!(server.active_connections(), 1);

            let mut second = TcpStream::connect(addr).unwrap();
            second.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
            second.set_nonblocking(true).unwrap();
            let mut out = Vec::new();
            for _ in 0..50 {
                server.run_once().unwrap();
                assert!(!drain(&mut second, &mut out));
            }
            assert!(out.is_empty(), "second connection served while first held the slot");
            assert_eq!(server.active_connections(), 1);

            drop(first);
            let mut done = false;
            for _ in 0..5000 {
                server.run_once().unwrap();
                if drain(&mut second, &mut out) {
                    done = true;
                    break;
                }
            }
            assert!(done);
            assert!(out.starts_with(b"HTTP/1.1 200 OK"));
        }
    }

    #[test]
    fn idle_connections_expire() {
        let cfg = config(EventMethod::Poll, 2).idle_timeout_secs(0);
        let mut server = Server::new(&cfg);
        let addr = server.add_listener("127.0.0.1", 0, hello_factory()).unwrap();
        let _idle = TcpStream::connect(addr).unwrap();
        for _ in 0..50 {
            server.run_once().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(server.active_connections(), 0);
    }

    #[test]
    fn stop_drains_and_returns() {
        let mut server = Server::new(&config(EventMethod::Poll, 2));
        let addr = server.add_listener("127.0.0.1", 0, hello_factory()).unwrap();
        let _idle = TcpStream::connect(addr).unwrap();
        for _ in 0..20 {
            server.run_once().unwrap();
        }
        assert_eq!(server.active_connections(), 1);
        server.stop(libc::SIGTERM);
        let mut stopped = false;
        for _ in 0..100 {
            if !server.run_once().unwrap() {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
        assert_eq!(server.active_connections(), 0);
    }

    // ── Cross-tier ──

    struct Tiers {
        server: Server,
        backend: SocketAddr,
        frontend: SocketAddr,
        device: Rc<BlockDevice>,
        _dir: tempfile::TempDir,
    }

    const ROOT_BLOCKS: u32 = 1;
    const BLOCKS: u32 = 64;

    fn tiers(method: EventMethod, credential: Option<&str>) -> Tiers {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("disk.bin"), BLOCKS, BS).unwrap();
        let device = Rc::new(BlockDevice::new(store, credential.map(str::to_string)));

        let mut server = Server::new(&config(method, 8));
        let backend = server
            .add_listener(
                "127.0.0.1",
                0,
                ConnectionFactory::new(
                    services::block_device_registry(device.clone()),
                    DeviceMap::empty(),
                    BS,
                ),
            )
            .unwrap();

        let mut devices = DeviceMap::empty();
        devices
            .push("bd0".into(), backend, BLOCKS, credential.map(str::to_string))
            .unwrap();
        let fs = Rc::new(FsSettings {
            geometry: Geometry::new(BS),
            root_blocks: ROOT_BLOCKS,
        });
        let frontend = server
            .add_listener(
                "127.0.0.1",
                0,
                ConnectionFactory::new(services::frontend_registry(fs), devices, BS),
            )
            .unwrap();
        Tiers {
            server,
            backend,
            frontend,
            device,
            _dir: dir,
        }
    }

    fn put(device: &BlockDevice, secret: &str, name: &str, data: &[u8], alloc: &mut SequentialAllocator) {
        let key = UserKey::derive(secret.as_bytes());
        let file = FileWriter::encode(&key, name, data, Geometry::new(BS), alloc).unwrap();
        for (n, block) in &file.blocks {
            device.store().write_block(*n, block).unwrap();
        }
        let mut root = device.store().read_block(0).unwrap();
        file.entry.insert_into(&mut root).unwrap();
        device.store().write_block(0, &root).unwrap();
    }

    #[test]
    fn backend_read_write() {
        let mut t = tiers(EventMethod::Poll, None);
        let mut req = b"GET /write?block=3 HTTP/1.1\r\nContent-Length: 512\r\n\r\n".to_vec();
        req.extend_from_slice(&[0x5A; BS]);
        let (head, _) = split(&roundtrip(&mut t.server, t.backend, &req));
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        let (head, body) = split(&roundtrip(&mut t.server, t.backend, b"GET /read?block=3 HTTP/1.1\r\n\r\n"));
        assert!(head.contains("Content-Length: 512"));
        assert_eq!(body, vec![0x5A; BS]);

        let (head, _) = split(&roundtrip(&mut t.server, t.backend, b"GET /read?block=64 HTTP/1.1\r\n\r\n"));
        assert!(head.starts_with("HTTP/1.1 500"));
    }

    /// Send `request`, half-close, turn the reactor until EOF.
    fn half_closed_roundtrip(server: &mut Server, addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(request).unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();
        client.set_nonblocking(true).unwrap();
        let mut out = Vec::new();
        for _ in 0..5000 {
            server.run_once().unwrap();
            if drain(&mut client, &mut out) {
                return out;
            }
        }
        panic!("no complete response; got {:?}", String::from_utf8_lossy(&out));
    }

    #[test]
    fn half_closed_clients_are_answered() {
        let mut t = tiers(EventMethod::Poll, None);
        t.device.store().write_block(1, &[0x11; BS]).unwrap();
        let (head, body) = split(&half_closed_roundtrip(
            &mut t.server,
            t.backend,
            b"GET /read?block=1 HTTP/1.1\r\n\r\n",
        ));
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
        assert_eq!(body, vec![0x11; BS]);

        // EOF while the frontend is suspended on the backend
        let mut alloc = SequentialAllocator::new(ROOT_BLOCKS, BLOCKS);
        let data = vec![0x42u8; 3000];
        put(&t.device, "alice:pw", "big.bin", &data, &mut alloc);
        let (head, body) = split(&half_closed_roundtrip(
            &mut t.server,
            t.frontend,
            b"GET /download?filename=big.bin HTTP/1.1\r\nAuthorization: alice:pw\r\n\r\n",
        ));
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
        assert_eq!(body, data);

        // an incomplete request at EOF is dropped without a response
        let out = half_closed_roundtrip(&mut t.server, t.backend, b"GET /read?blo");
        assert!(out.is_empty());
        for _ in 0..10 {
            t.server.run_once().unwrap();
        }
        assert_eq!(t.server.active_connections(), 0);
    }

    #[test]
    fn backend_credential_is_enforced() {
        let mut t = tiers(EventMethod::Poll, Some("bd:pw"));
        let (head, _) = split(&roundtrip(&mut t.server, t.backend, b"GET /read?block=1 HTTP/1.1\r\n\r\n"));
        assert!(head.starts_with("HTTP/1.1 401"));
        let (head, _) = split(&roundtrip(
            &mut t.server,
            t.backend,
            b"GET /read?block=1 HTTP/1.1\r\nAuthorization: bd:pw\r\n\r\n",
        ));
        assert!(head.starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn download_across_tiers() {
        for method in [EventMethod::Poll, EventMethod::Select] {
            let mut t = tiers(method, Some("bd:pw"));
            let mut alloc = SequentialAllocator::new(ROOT_BLOCKS, BLOCKS);
            let data: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 256) as u8).collect();
            put(&t.device, "alice:pw", "other.bin", b"not this one", &mut alloc);
            put(&t.device, "alice:pw", "photo.png", &data, &mut alloc);

            let (head, body) = split(&roundtrip(
                &mut t.server,
                t.frontend,
                b"GET /download?filename=photo.png HTTP/1.1\r\nAuthorization: alice:pw\r\n\r\n",
            ));
            assert!(head.starts_with("HTTP/1.1 200 OK"), "{}", head);
            assert!(head.contains("Content-Length: 5000"));
            assert!(head.contains("Content-Type: image/png"));
            assert!(head.contains("Content-Disposition: attachment; filename=photo.png"));
            assert_eq!(body, data);

            // cookie carries the credential too
            let (head, body) = split(&roundtrip(
                &mut t.server,
                t.frontend,
                b"GET /download?filename=other.bin HTTP/1.1\r\nCookie: authorization=alice:pw\r\n\r\n",
            ));
            assert!(head.starts_with("HTTP/1.1 200"));
            assert_eq!(body, b"not this one");
        }
    }

    #[test]
    fn download_failures_are_generic() {
        let mut t = tiers(EventMethod::Poll, None);
        let mut alloc = SequentialAllocator::new(ROOT_BLOCKS, BLOCKS);
        put(&t.device, "alice:pw", "a.txt", b"secret", &mut alloc);

        let wrong = roundtrip(
            &mut t.server,
            t.frontend,
            b"GET /download?filename=a.txt HTTP/1.1\r\nAuthorization: alice:nope\r\n\r\n",
        );
        let missing = roundtrip(
            &mut t.server,
            t.frontend,
            b"GET /download?filename=a.txt HTTP/1.1\r\nAuthorization: bob:pw\r\n\r\n",
        );
        assert_eq!(wrong, missing);
        let (head, body) = split(&wrong);
        assert!(head.starts_with("HTTP/1.1 500 Internal Error"));
        assert!(String::from_utf8_lossy(&body).contains("File a.txt does not exist"));

        let (head, _) = split(&roundtrip(&mut t.server, t.frontend, b"GET /download?filename=a.txt HTTP/1.1\r\n\r\n"));
        assert!(head.starts_with("HTTP/1.1 401"));

        let (head, body) = split(&roundtrip(
            &mut t.server,
            t.frontend,
            b"GET /download HTTP/1.1\r\nAuthorization: alice:pw\r\n\r\n",
        ));
        assert!(head.starts_with("HTTP/1.1 500"));
        assert!(String::from_utf8_lossy(&body).contains("File name missing"));
    }

    #[test]
    fn unreachable_backend_fails_only_that_request() {
        let mut server = Server::new(&config(EventMethod::Poll, 4));
        // reserve a port nobody listens on
        let dead = net::bind_listener(&net::resolve("127.0.0.1", 0).unwrap())
            .unwrap()
            .local_addr()
            .unwrap();
        let mut devices = DeviceMap::empty();
        devices.push("gone".into(), dead, BLOCKS, None).unwrap();
        let fs = Rc::new(FsSettings {
            geometry: Geometry::new(BS),
            root_blocks: ROOT_BLOCKS,
        });
        let frontend = server
            .add_listener("127.0.0.1", 0, ConnectionFactory::new(services::frontend_registry(fs), devices, BS))
            .unwrap();
        let (head, _) = split(&roundtrip(
            &mut server,
            frontend,
            b"GET /download?filename=x HTTP/1.1\r\nAuthorization: a:b\r\n\r\n",
        ));
        assert!(head.starts_with("HTTP/1.1 500"));
        assert!(server.run_once().unwrap());
    }
}
