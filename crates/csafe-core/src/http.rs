//! Line-oriented HTTP-subset framing.
//!
//! ```text
//! request  = METHOD SP /path?query SP SIGNATURE CRLF *(Key: value CRLF) CRLF [body]
//! response = SIGNATURE SP code SP status-text CRLF *(Key: value CRLF) CRLF body
//! ```
//!
//! The body is sized by `Content-Length`; there is no chunked transfer.
//! Parsing is incremental: every function here consumes only complete
//! lines from the front of a receive buffer and leaves partial input in
//! place, so a header block may arrive across any number of reads.

use std::collections::{BTreeMap, HashMap};

use crate::constants::{CONTENT_LENGTH, CRLF, MAX_NUMBER_OF_HEADERS, SIGNATURE};
use crate::error::ProtocolError;

/// Remove and return the first CRLF-terminated line, without the CRLF.
/// Returns `None` (buffer untouched) if no full line is buffered yet.
pub fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let n = buf.windows(CRLF.len()).position(|w| w == CRLF)?;
    let mut line: Vec<u8> = buf.drain(..n + CRLF.len()).collect();
    line.truncate(n);
    Some(line)
}

/// Header map with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    map: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.map.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// `Content-Length`, 0 when absent.
    pub fn content_length(&self) -> Result<usize, ProtocolError> {
        match self.get(CONTENT_LENGTH) {
            None => Ok(0),
            Some(v) => v.trim().parse().map_err(|_| ProtocolError::BadContentLength),
        }
    }
}

/// Split `Key: value` into its parts.
pub fn parse_header(line: &[u8]) -> Result<(String, String), ProtocolError> {
    let line = std::str::from_utf8(line).map_err(|_| ProtocolError::MalformedHeader)?;
    let (name, value) = line.split_once(':').ok_or(ProtocolError::MalformedHeader)?;
    let name = name.trim_end();
    if name.is_empty() {
        return Err(ProtocolError::MalformedHeader);
    }
    Ok((name.to_string(), value.trim_start().to_string()))
}

/// Incremental header-block parser.
///
/// Call `feed()` after every read. Consumed lines leave the buffer; a
/// partial last line stays for the next call. The header count limit
/// applies to the whole block, not to one call.
#[derive(Debug)]
pub struct HeaderParser {
    headers: Headers,
    count: usize,
    limit: usize,
    finished: bool,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new(MAX_NUMBER_OF_HEADERS)
    }
}

impl HeaderParser {
    pub fn new(limit: usize) -> Self {
        Self {
            headers: Headers::new(),
            count: 0,
            limit,
            finished: false,
        }
    }

    /// Returns `Ok(true)` once the terminating blank line was consumed.
    pub fn feed(&mut self, buf: &mut Vec<u8>) -> Result<bool, ProtocolError> {
        while !self.finished {
            let line = match take_line(buf) {
                Some(line) => line,
                None => break,
            };
            if line.is_empty() {
                self.finished = true;
                break;
            }
            self.count += 1;
            if self.count > self.limit {
                return Err(ProtocolError::TooManyHeaders(self.limit));
            }
            let (name, value) = parse_header(&line)?;
            self.headers.insert(&name, value);
        }
        Ok(self.finished)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn into_headers(self) -> Headers {
        self.headers
    }
}

/// Decoded query string.
pub type Query = HashMap<String, String>;

/// `METHOD /path?query SIGNATURE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
    pub query: Query,
}

pub fn parse_request_line(line: &[u8]) -> Result<RequestLine, ProtocolError> {
    let line = std::str::from_utf8(line).map_err(|_| ProtocolError::MalformedRequestLine)?;
    let mut parts = line.split(' ');
    let (method, uri, signature) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(s), None) if !m.is_empty() && u.starts_with('/') => (m, u, s),
        _ => return Err(ProtocolError::MalformedRequestLine),
    };
    if signature != SIGNATURE {
        return Err(ProtocolError::BadSignature(signature.to_string()));
    }
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (uri, Query::new()),
    };
    Ok(RequestLine {
        method: method.to_string(),
        path: percent_decode(path),
        query,
    })
}

/// `SIGNATURE code status-text` → code.
pub fn parse_status_line(line: &[u8]) -> Result<u16, ProtocolError> {
    let line = std::str::from_utf8(line).map_err(|_| ProtocolError::MalformedStatusLine)?;
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next()) {
        (Some(sig), Some(code)) if sig == SIGNATURE => {
            code.parse().map_err(|_| ProtocolError::MalformedStatusLine)
        }
        (Some(sig), Some(_)) => Err(ProtocolError::BadSignature(sig.to_string())),
        _ => Err(ProtocolError::MalformedStatusLine),
    }
}

pub fn parse_query(query: &str) -> Query {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// `%XX` and `+` decoding. Invalid escapes pass through verbatim.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(h), Some(l)) => {
                        out.push(h << 4 | l);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Value of cookie `name` in a `Cookie:` header.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|c| c.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
}

// ── Writers ──

pub fn write_status_line(out: &mut Vec<u8>, code: u16, status: &str) {
    out.extend_from_slice(format!("{} {} {}\r\n", SIGNATURE, code, status).as_bytes());
}

pub fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
}

pub fn end_headers(out: &mut Vec<u8>) {
    out.extend_from_slice(CRLF);
}

/// Request line for a block operation: `GET /read?block=7 HTTP/1.1`.
pub fn write_request_line(out: &mut Vec<u8>, method: &str, path: &str, query: &str) {
    out.extend_from_slice(format!("{} {}?{} {}\r\n", method, path, query, SIGNATURE).as_bytes());
}

/// Minimal HTML document carrying an error / status message.
pub fn text_to_html(text: &str) -> String {
    format!("<HTML>\r\n<BODY>\r\n{}\r\n</BODY>\r\n</HTML>", html_escape(text))
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
