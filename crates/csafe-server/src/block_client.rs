//! `BlockClient` — one block READ/WRITE against a backend device.
//!
//! Spawned by a connection on behalf of its suspended service. Connects,
//! sends `GET /read?block=n` (or `/write` with the block as body), parses
//! the reply and posts exactly one `Completion` to its owner: the block
//! bytes, an empty acknowledgement, or a `BackendError`. Any socket failure
//! or expiry reaches the owner through `on_abort`.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use csafe_core::broker::Interest;
use csafe_core::constants::{AUTHORIZATION, CONTENT_LENGTH};
use csafe_core::error::{BackendError, HttpError};
use csafe_core::http::{
    end_headers, parse_status_line, take_line, write_header, write_request_line, HeaderParser,
};
use csafe_core::pollable::{BlockReply, Completion, Context, OpId, Pollable, Token};
use csafe_core::service::BlockAction;
use csafe_module::device_map::Device;
use tracing::{debug, trace};

use crate::net;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Sending,
    ReadStatus,
    ReadHeaders,
    ReadBody,
    Done,
}

pub struct BlockClient {
    stream: TcpStream,
    peer: SocketAddr,
    owner: Token,
    op: OpId,
    block: u32,
    writing: bool,
    block_size: usize,
    state: ClientState,
    send: Vec<u8>,
    send_off: usize,
    recv: Vec<u8>,
    headers: HeaderParser,
    body: Vec<u8>,
    body_len: usize,
    last_activity: Instant,
}

/// Serialize a block request.
pub fn encode_request(
    block: u32,
    action: &BlockAction,
    authorization: Option<&str>,
) -> Vec<u8> {
    let mut out = Vec::new();
    write_request_line(&mut out, "GET", action.path(), &format!("block={}", block));
    if let Some(auth) = authorization {
        write_header(&mut out, AUTHORIZATION, auth);
    }
    match action {
        BlockAction::Read => end_headers(&mut out),
        BlockAction::Write(data) => {
            write_header(&mut out, CONTENT_LENGTH, &data.len().to_string());
            end_headers(&mut out);
            out.extend_from_slice(data);
        }
    }
    out
}

impl BlockClient {
    /// Start the connect. Refusals the kernel reports synchronously surface
    /// here as a request error.
    pub fn connect(
        device: &Device,
        local_block: u32,
        action: BlockAction,
        block_size: usize,
        owner: Token,
        op: OpId,
        now: Instant,
    ) -> Result<Self, HttpError> {
        let stream = net::connect_nonblocking(&device.addr).map_err(|e| {
            BackendError::Unavailable(format!("{} ({}): {}", device.name, device.addr, e))
        })?;
        trace!(device = %device.name, block = local_block, op, "block request");
        Ok(Self {
            stream,
            peer: device.addr,
            owner,
            op,
            block: local_block,
            writing: matches!(action, BlockAction::Write(_)),
            block_size,
            state: ClientState::Connecting,
            send: encode_request(local_block, &action, device.authorization.as_deref()),
            send_off: 0,
            recv: Vec::new(),
            headers: HeaderParser::default(),
            body: Vec::new(),
            body_len: 0,
            last_activity: now,
        })
    }

    fn deliver(&mut self, cx: &mut Context<'_>, reply: BlockReply) {
        if self.state == ClientState::Done {
            return;
        }
        self.state = ClientState::Done;
        if let Err(e) = &reply {
            debug!(peer = %self.peer, block = self.block, error = %e, "block operation failed");
        }
        cx.complete(Completion {
            owner: self.owner,
            op: self.op,
            reply,
        });
    }

    /// Parse as much of the reply as is buffered.
    fn process(&mut self) -> Result<Option<Vec<u8>>, BackendError> {
        loop {
            match self.state {
                ClientState::ReadStatus => {
                    let line = match take_line(&mut self.recv) {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    let code = parse_status_line(&line)?;
                    if code != 200 {
                        return Err(BackendError::Status(code));
                    }
                    self.state = ClientState::ReadHeaders;
                }
                ClientState::ReadHeaders => {
                    if !self.headers.feed(&mut self.recv)? {
                        return Ok(None);
                    }
                    let len = self.headers.headers().content_length()?;
                    let expected = if self.writing { 0 } else { self.block_size };
                    if len != expected {
                        return Err(BackendError::BlockSizeMismatch { expected, got: len });
                    }
                    self.body_len = len;
                    self.body = Vec::with_capacity(len);
                    self.state = ClientState::ReadBody;
                }
                ClientState::ReadBody => {
                    let n = self.recv.len().min(self.body_len - self.body.len());
                    self.body.extend(self.recv.drain(..n));
                    if self.body.len() < self.body_len {
                        return Ok(None);
                    }
                    return Ok(Some(std::mem::take(&mut self.body)));
                }
                _ => return Ok(None),
            }
        }
    }
}

impl Pollable for BlockClient {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn interest(&self) -> Interest {
        match self.state {
            ClientState::Connecting | ClientState::Sending => Interest::WRITABLE,
            ClientState::Done => Interest::NONE,
            _ => Interest::READABLE,
        }
    }

    fn on_readable(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if matches!(self.state, ClientState::Connecting | ClientState::Sending) {
            // error / hang-up reported before the request went out
            if let Some(e) = self.stream.take_error()? {
                return Err(e);
            }
            return Ok(());
        }
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.deliver(
                        cx,
                        Err(BackendError::Unavailable("connection closed mid-reply".into())),
                    );
                    return Ok(());
                }
                Ok(n) => {
                    self.last_activity = cx.now();
                    self.recv.extend_from_slice(&buf[..n]);
                    match self.process() {
                        Ok(Some(body)) => {
                            self.deliver(cx, Ok(body));
                            return Ok(());
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.deliver(cx, Err(e));
                            return Ok(());
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn on_writable(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if !matches!(self.state, ClientState::Connecting | ClientState::Sending) {
            return Ok(());
        }
        if self.state == ClientState::Connecting {
            if let Some(e) = self.stream.take_error()? {
                return Err(e);
            }
            self.state = ClientState::Sending;
        }
        while self.send_off < self.send.len() {
            match self.stream.write(&self.send[self.send_off..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.send_off += n;
                    self.last_activity = cx.now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.send = Vec::new();
        self.state = ClientState::ReadStatus;
        Ok(())
    }

    fn on_abort(&mut self, cx: &mut Context<'_>, reason: &io::Error) {
        let err = match reason.kind() {
            io::ErrorKind::TimedOut => BackendError::TimedOut,
            _ => BackendError::Unavailable(format!("{}: {}", self.peer, reason)),
        };
        self.deliver(cx, Err(err));
    }

    fn is_closed(&self) -> bool {
        self.state == ClientState::Done
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::TcpListener;

    #[test]
    fn request_encoding() {
        let read = encode_request(7, &BlockAction::Read, Some("u:p"));
        assert_eq!(
            read,
            b"GET /read?block=7 HTTP/1.1\r\nAuthorization: u:p\r\n\r\n".to_vec()
        );
        let write = encode_request(2, &BlockAction::Write(b"abc".to_vec()), None);
        assert_eq!(
            write,
            b"GET /write?block=2 HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc".to_vec()
        );
    }

    fn client(addr: SocketAddr, action: BlockAction) -> BlockClient {
        let device = Device {
            name: "bd".into(),
            addr,
            first_block: 0,
            blocks: 8,
            authorization: None,
        };
        let owner = Token { slot: 3, generation: 1 };
        BlockClient::connect(&device, 5, action, 128, owner, 42, Instant::now()).unwrap()
    }

    /// Consume one full request (headers plus `Content-Length` body).
    fn read_request(peer: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = peer.read(&mut chunk).unwrap();
            if n == 0 {
                return buf;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .map_or(0, |v| v.parse::<usize>().unwrap());
                if buf.len() >= end + 4 + len {
                    return buf;
                }
            }
        }
    }

    /// Run a client against a peer that answers with `reply`.
    fn run(action: BlockAction, reply: &[u8]) -> (Vec<u8>, Completion) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut c = client(listener.local_addr().unwrap(), action);
        let reply = reply.to_vec();
        let peer = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let request = read_request(&mut peer);
            peer.write_all(&reply).unwrap();
            request
        });

        let mut spawned = Vec::new();
        let mut completions = VecDeque::new();
        let token = Token { slot: 9, generation: 1 };
        for _ in 0..2000 {
            let mut cx = Context::new(token, Instant::now(), &mut spawned, &mut completions);
            c.on_writable(&mut cx).unwrap();
            c.on_readable(&mut cx).unwrap();
            if c.is_closed() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let request = peer.join().unwrap();
        assert_eq!(completions.len(), 1);
        (request, completions.pop_front().unwrap())
    }

    #[test]
    fn read_reply_delivers_block_once() {
        let mut reply = b"HTTP/1.1 200 OK\r\nContent-Length: 128\r\n\r\n".to_vec();
        reply.extend_from_slice(&[0xEE; 128]);
        let (request, done) = run(BlockAction::Read, &reply);
        assert!(request.starts_with(b"GET /read?block=5 HTTP/1.1\r\n"));
        assert_eq!(done.owner, Token { slot: 3, generation: 1 });
        assert_eq!(done.op, 42);
        assert_eq!(done.reply.unwrap(), vec![0xEE; 128]);
    }

    #[test]
    fn write_is_acknowledged_with_empty_body() {
        let (request, done) = run(
            BlockAction::Write(vec![7; 128]),
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(request.ends_with(&[7; 128]));
        assert_eq!(done.reply, Ok(Vec::new()));
    }

    #[test]
    fn size_mismatch_and_status_errors() {
        let (_, done) = run(
            BlockAction::Read,
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nabcd",
        );
        assert_eq!(
            done.reply,
            Err(BackendError::BlockSizeMismatch { expected: 128, got: 4 })
        );

        let (_, done) = run(
            BlockAction::Write(vec![1; 128]),
            b"HTTP/1.1 401 Unauthorized\r\n\r\n",
        );
        assert_eq!(done.reply, Err(BackendError::Status(401)));
    }

    #[test]
    fn abort_reports_timeout_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut c = client(listener.local_addr().unwrap(), BlockAction::Read);
        let mut spawned = Vec::new();
        let mut completions = VecDeque::new();
        let mut cx = Context::new(Token { slot: 0, generation: 1 }, Instant::now(), &mut spawned, &mut completions);
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "idle");
        c.on_abort(&mut cx, &timeout);
        c.on_abort(&mut cx, &timeout);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].reply, Err(BackendError::TimedOut));
    }
}
