//! Per-path request handlers.
//!
//! A `Service` is created for one request and driven by the connection:
//!
//! ```text
//! before_request_content ─► handle_content* ─► before_response_headers* ─► produce_response*
//!                                                   │            ▲              │        ▲
//!                                                Suspend      resume         Suspend   resume
//!                                                   └── block ───┘              └─ block ┘
//! ```
//!
//! Both `before_response_headers` and `produce_response` may start one
//! block operation through `BlockIo` and return a suspension. The driver
//! then does not call the service again until exactly one completion for
//! that operation has been handed to `resume()`.

use crate::constants::{AUTHORIZATION, AUTHORIZATION_COOKIE, COOKIE};
use crate::error::HttpError;
use crate::http::{cookie_value, Headers, Query};
use crate::pollable::BlockReply;

/// One step of response production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Produce {
    /// A body chunk to send now. The driver calls again.
    Emit(Vec<u8>),
    /// A block operation was started; wait for its completion.
    Suspend,
    /// The response body is complete.
    Done,
}

/// Outcome of the pre-header hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Status and headers are final; they may be written.
    Ready,
    /// A block operation was started; wait for its completion.
    Suspend,
}

/// Block operation requested by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockAction {
    Read,
    Write(Vec<u8>),
}

impl BlockAction {
    pub fn path(&self) -> &'static str {
        match self {
            BlockAction::Read => crate::constants::READ_PATH,
            BlockAction::Write(_) => crate::constants::WRITE_PATH,
        }
    }
}

/// The bd_action seam.
///
/// **Contract:** at most one operation per suspension. A second call
/// before the service returns fails with an `HttpError`.
pub trait BlockIo {
    fn bd_action(&mut self, block_num: u32, action: BlockAction) -> Result<(), HttpError>;
}

/// Per-request state shared between the connection and its service.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub query: Query,
    pub headers: Headers,
    /// Request body collected so far (services that keep the default
    /// `handle_content`).
    pub content: Vec<u8>,
    pub code: u16,
    pub status: &'static str,
    pub response_headers: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new(method: String, path: String, query: Query, headers: Headers) -> Self {
        Self {
            method,
            path,
            query,
            headers,
            content: Vec::new(),
            code: 200,
            status: "OK",
            response_headers: Vec::new(),
        }
    }

    /// Set (or replace) a response header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .response_headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value,
            None => self.response_headers.push((name.to_string(), value)),
        }
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Credential token: `Authorization` header, else the
    /// `authorization` cookie.
    pub fn authorization(&self) -> Option<String> {
        if let Some(v) = self.headers.get(AUTHORIZATION) {
            return Some(v.to_string());
        }
        self.headers
            .get(COOKIE)
            .and_then(|c| cookie_value(c, AUTHORIZATION_COOKIE))
            .map(str::to_string)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// A suspendable per-request handler.
pub trait Service {
    /// Request path this service answers.
    fn name(&self) -> &'static str;

    /// Called once headers are parsed, before any body byte is consumed.
    fn before_request_content(&mut self, _req: &mut RequestContext) -> Result<(), HttpError> {
        Ok(())
    }

    /// Largest body this service accepts.
    fn max_content_length(&self) -> usize {
        0
    }

    /// Body bytes as they arrive.
    fn handle_content(&mut self, req: &mut RequestContext, chunk: &[u8]) -> Result<(), HttpError> {
        req.content.extend_from_slice(chunk);
        Ok(())
    }

    /// Finalize status and headers. Called repeatedly until `Ready`.
    fn before_response_headers(
        &mut self,
        _req: &mut RequestContext,
        _io: &mut dyn BlockIo,
    ) -> Result<Progress, HttpError> {
        Ok(Progress::Ready)
    }

    /// Produce the next body step.
    fn produce_response(
        &mut self,
        req: &mut RequestContext,
        io: &mut dyn BlockIo,
    ) -> Result<Produce, HttpError>;

    /// Continuation: the block operation started by the last suspension
    /// finished.
    fn resume(&mut self, _req: &mut RequestContext, _reply: BlockReply) -> Result<(), HttpError> {
        Err(HttpError::internal(format!(
            "service {} does not suspend",
            self.name()
        )))
    }
}
