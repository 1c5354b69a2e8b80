//! Per-socket request state machine.
//!
//! ```text
//! ReadRequestLine ─► ReadHeaders ─► ReadContent ─► Dispatch ─► WriteBody ─► Drain ─► Closed
//!                                                   │    ▲        │    ▲
//!                                                   ▼    │        ▼    │
//!                                                 AwaitBackend  AwaitBackend
//! ```
//!
//! One request per connection; every response carries `Connection: close`.
//! Any `HttpError` before the status line is written becomes an HTML error
//! response followed by drain and close. After the status line the only
//! option left is to close.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Instant;

use csafe_core::broker::Interest;
use csafe_core::constants::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use csafe_core::error::{HttpError, ProtocolError};
use csafe_core::http::{
    end_headers, parse_request_line, take_line, text_to_html, write_header, write_status_line,
    HeaderParser, RequestLine,
};
use csafe_core::pollable::{Completion, Context, OpId, Pollable};
use csafe_core::service::{BlockAction, RequestContext};
use csafe_module::device_map::DeviceMap;
use csafe_module::registry::ServiceRegistry;
use tracing::{debug, info, warn};

use crate::block_client::BlockClient;
use crate::exchange::{BlockSubmit, Exchange, Output};

/// Stop producing body while this much is queued for the socket.
const SEND_HIGH_WATER: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Everything connections accepted on one listener share.
#[derive(Clone)]
pub struct ConnectionFactory {
    registry: Rc<ServiceRegistry>,
    devices: Rc<DeviceMap>,
    block_size: usize,
}

impl ConnectionFactory {
    pub fn new(registry: ServiceRegistry, devices: DeviceMap, block_size: usize) -> Self {
        Self {
            registry: Rc::new(registry),
            devices: Rc::new(devices),
            block_size,
        }
    }

    pub fn create(&self, stream: TcpStream, peer: SocketAddr, now: Instant) -> Connection {
        Connection {
            stream,
            peer,
            state: ConnState::ReadRequestLine,
            recv: Vec::with_capacity(self.block_size),
            send: Vec::new(),
            send_off: 0,
            request_line: None,
            headers: HeaderParser::default(),
            exchange: None,
            content_left: 0,
            peer_eof: false,
            shared: self.clone(),
            last_activity: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadRequestLine,
    ReadHeaders,
    ReadContent,
    /// Driving the service before the status line is out.
    Dispatch,
    AwaitBackend,
    WriteBody,
    /// Response complete; flushing the send buffer.
    Drain,
    Closed,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    recv: Vec<u8>,
    send: Vec<u8>,
    send_off: usize,
    request_line: Option<RequestLine>,
    headers: HeaderParser,
    exchange: Option<Exchange>,
    content_left: usize,
    /// Peer half-closed its sending side.
    peer_eof: bool,
    shared: ConnectionFactory,
    last_activity: Instant,
}

/// Routes a service's block operation to the owning device.
struct BackendSubmit<'c, 'a> {
    cx: &'c mut Context<'a>,
    devices: &'c DeviceMap,
    block_size: usize,
}

impl BlockSubmit for BackendSubmit<'_, '_> {
    fn submit(&mut self, op: OpId, block_num: u32, action: BlockAction) -> Result<(), HttpError> {
        let (device, local) = self
            .devices
            .locate(block_num)
            .ok_or_else(|| HttpError::internal(format!("block {} is on no device", block_num)))?;
        let client = BlockClient::connect(
            device,
            local,
            action,
            self.block_size,
            self.cx.token(),
            op,
            self.cx.now(),
        )?;
        self.cx.spawn(Box::new(client));
        Ok(())
    }
}

impl Connection {
    pub fn state(&self) -> ConnState {
        self.state
    }

    fn reading(&self) -> bool {
        matches!(
            self.state,
            ConnState::ReadRequestLine | ConnState::ReadHeaders | ConnState::ReadContent
        )
    }

    fn pending_send(&self) -> usize {
        self.send.len() - self.send_off
    }

    /// Consume buffered input as far as the state machine allows.
    fn advance(&mut self, cx: &mut Context<'_>) {
        if let Err(e) = self.process_input() {
            self.fail(e);
            return;
        }
        if self.state == ConnState::Dispatch {
            self.pump(cx);
        }
    }

    fn process_input(&mut self) -> Result<(), HttpError> {
        loop {
            match self.state {
                ConnState::ReadRequestLine => match take_line(&mut self.recv) {
                    Some(line) => {
                        self.request_line = Some(parse_request_line(&line)?);
                        self.state = ConnState::ReadHeaders;
                    }
                    None => return self.check_capacity(),
                },
                ConnState::ReadHeaders => {
                    if !self.headers.feed(&mut self.recv)? {
                        return self.check_capacity();
                    }
                    self.dispatch()?;
                }
                ConnState::ReadContent => {
                    if self.recv.is_empty() {
                        return Ok(());
                    }
                    let n = self.recv.len().min(self.content_left);
                    let chunk: Vec<u8> = self.recv.drain(..n).collect();
                    self.content_left -= n;
                    if let Some(ex) = self.exchange.as_mut() {
                        ex.content(&chunk)?;
                    }
                    if self.content_left == 0 {
                        self.state = ConnState::Dispatch;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn check_capacity(&self) -> Result<(), HttpError> {
        if self.recv.len() >= self.shared.block_size {
            return Err(ProtocolError::RequestTooLarge(self.shared.block_size).into());
        }
        Ok(())
    }

    /// Headers are complete: pick the service and set up the exchange.
    fn dispatch(&mut self) -> Result<(), HttpError> {
        let line = self
            .request_line
            .take()
            .ok_or_else(|| HttpError::internal("headers without request line"))?;
        let headers = std::mem::take(&mut self.headers).into_headers();
        let content_length = headers.content_length()?;
        debug!(peer = %self.peer, method = %line.method, path = %line.path, "request");

        let service = self
            .shared
            .registry
            .create(&line.path)
            .ok_or_else(|| HttpError::not_found(format!("{} not found", line.path)))?;
        let req = RequestContext::new(line.method, line.path, line.query, headers);
        let mut exchange = Exchange::new(service, req);
        exchange.begin()?;
        if content_length > exchange.max_content_length() {
            return Err(HttpError::internal(format!(
                "content of {} bytes exceeds limit of {}",
                content_length,
                exchange.max_content_length()
            )));
        }
        self.exchange = Some(exchange);
        self.content_left = content_length;
        self.state = if content_length > 0 {
            ConnState::ReadContent
        } else {
            ConnState::Dispatch
        };
        Ok(())
    }

    /// Drive the exchange until it suspends, finishes or the send buffer
    /// fills up.
    fn pump(&mut self, cx: &mut Context<'_>) {
        loop {
            if !matches!(self.state, ConnState::Dispatch | ConnState::WriteBody) {
                return;
            }
            if self.pending_send() >= SEND_HIGH_WATER {
                return;
            }
            let exchange = match self.exchange.as_mut() {
                Some(ex) => ex,
                None => return,
            };
            let mut submit = BackendSubmit {
                cx: &mut *cx,
                devices: &self.shared.devices,
                block_size: self.shared.block_size,
            };
            match exchange.drive(&mut submit) {
                Ok(Output::Head) => {
                    let req = exchange.request();
                    write_status_line(&mut self.send, req.code, req.status);
                    for (name, value) in &req.response_headers {
                        write_header(&mut self.send, name, value);
                    }
                    write_header(&mut self.send, CONNECTION, "close");
                    end_headers(&mut self.send);
                    self.state = ConnState::WriteBody;
                }
                Ok(Output::Body(chunk)) => self.send.extend_from_slice(&chunk),
                Ok(Output::Suspended) => {
                    self.state = ConnState::AwaitBackend;
                    return;
                }
                Ok(Output::Finished) => {
                    info!(
                        peer = %self.peer,
                        path = %exchange.request().path,
                        code = exchange.request().code,
                        "response complete"
                    );
                    self.exchange = None;
                    self.state = ConnState::Drain;
                    return;
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    /// Turn a request failure into a response, or close if too late.
    fn fail(&mut self, err: HttpError) {
        let headers_sent = self.exchange.as_ref().map_or(false, |ex| ex.headers_done());
        self.exchange = None;
        if headers_sent {
            warn!(peer = %self.peer, error = %err, "failure after status line, closing");
            self.state = ConnState::Closed;
            return;
        }
        info!(peer = %self.peer, code = err.code, error = %err.message, "request failed");
        let body = text_to_html(&err.message);
        self.send.clear();
        self.send_off = 0;
        write_status_line(&mut self.send, err.code, err.status);
        write_header(&mut self.send, CONTENT_TYPE, "text/html");
        write_header(&mut self.send, CONTENT_LENGTH, &body.len().to_string());
        write_header(&mut self.send, CONNECTION, "close");
        end_headers(&mut self.send);
        self.send.extend_from_slice(body.as_bytes());
        self.recv.clear();
        self.state = ConnState::Drain;
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = ConnState::Closed;
    }
}

impl Pollable for Connection {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn interest(&self) -> Interest {
        match self.state {
            ConnState::ReadRequestLine | ConnState::ReadHeaders | ConnState::ReadContent
                if !self.peer_eof =>
            {
                Interest::READABLE
            }
            ConnState::Closed => Interest::NONE,
            _ if self.pending_send() > 0 => Interest::WRITABLE,
            _ => Interest::NONE,
        }
    }

    fn on_readable(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            // bounded by block size while reading; any size afterwards only
            // to observe EOF / errors
            if self.peer_eof {
                break;
            }
            let room = if self.reading() {
                self.shared.block_size.saturating_sub(self.recv.len()).min(READ_CHUNK)
            } else {
                READ_CHUNK
            };
            if room == 0 {
                break;
            }
            match self.stream.read(&mut buf[..room]) {
                Ok(0) => {
                    debug!(peer = %self.peer, state = ?self.state, "peer closed");
                    self.peer_eof = true;
                    break;
                }
                Ok(n) => {
                    self.last_activity = cx.now();
                    if self.reading() {
                        self.recv.extend_from_slice(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.reading() {
            self.advance(cx);
        }
        // a request still incomplete at EOF can never finish; a response
        // already under way keeps draining to the half-closed peer
        if self.peer_eof && self.reading() {
            self.close();
        }
        Ok(())
    }

    fn on_writable(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        while self.pending_send() > 0 {
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
        self.send.clear();
        self.send_off = 0;
        match self.state {
            ConnState::Drain => self.close(),
            ConnState::WriteBody | ConnState::Dispatch => self.pump(cx),
            _ => {}
        }
        Ok(())
    }

    fn on_completion(&mut self, cx: &mut Context<'_>, completion: Completion) -> io::Result<()> {
        let exchange = match self.exchange.as_mut() {
            Some(ex) => ex,
            None => return Ok(()),
        };
        match exchange.complete(completion.op, completion.reply) {
            Ok(true) => {
                self.state = if exchange.headers_done() {
                    ConnState::WriteBody
                } else {
                    ConnState::Dispatch
                };
                self.pump(cx);
            }
            Ok(false) => debug!(op = completion.op, "stale completion ignored"),
            Err(e) => self.fail(e),
        }
        Ok(())
    }

    fn on_stop(&mut self) {
        // idle or half-read requests are dropped; responses in flight finish
        if self.reading() {
            self.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn expirable(&self) -> bool {
        self.state != ConnState::AwaitBackend
    }
}
