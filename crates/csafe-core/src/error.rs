//! csafe error types.
//!
//! Two channels: `HttpError` is the expected, per-request failure that
//! becomes a status line plus an error body. `std::io::Error` returned
//! from a pollable is fatal to that pollable only; the reactor logs it,
//! unregisters the descriptor and keeps running.

use thiserror::Error;

use crate::constants::status_text;

/// Malformed or oversized input on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("bad protocol signature: {0}")]
    BadSignature(String),
    #[error("malformed status line")]
    MalformedStatusLine,
    #[error("invalid header received")]
    MalformedHeader,
    #[error("exceeded max number of headers ({0})")]
    TooManyHeaders(usize),
    #[error("request exceeds buffer capacity ({0} bytes) before headers completed")]
    RequestTooLarge(usize),
    #[error("bad content length")]
    BadContentLength,
}

/// Failure talking to a block-device peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("block device unavailable: {0}")]
    Unavailable(String),
    #[error("block device answered {0}")]
    Status(u16),
    #[error("block size mismatch: expected {expected}, got {got}")]
    BlockSizeMismatch { expected: usize, got: usize },
    #[error("malformed block device reply: {0}")]
    Malformed(String),
    #[error("block device timed out")]
    TimedOut,
}

impl From<ProtocolError> for BackendError {
    fn from(e: ProtocolError) -> Self {
        BackendError::Malformed(e.to_string())
    }
}

/// An expected request-handling failure, rendered as a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {status}: {message}")]
pub struct HttpError {
    pub code: u16,
    pub status: &'static str,
    pub message: String,
}

impl HttpError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status: status_text(code),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }
}

impl From<ProtocolError> for HttpError {
    fn from(e: ProtocolError) -> Self {
        HttpError::internal(e.to_string())
    }
}

impl From<BackendError> for HttpError {
    fn from(e: BackendError) -> Self {
        HttpError::internal(e.to_string())
    }
}

/// Configuration load / validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

pub type Result<T> = std::result::Result<T, HttpError>;
