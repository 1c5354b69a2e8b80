//! Wire and layout constants shared by every tier.

/// Default block size. Every backend and frontend that talk to each other
/// must agree on it; a mismatch is detected on the first block reply.
pub const BLOCK_SIZE: usize = 4096;

/// AES block / IV length.
pub const IV_SIZE: usize = 16;

/// Protocol signature carried in request and status lines.
pub const SIGNATURE: &str = "HTTP/1.1";

pub const CRLF: &[u8] = b"\r\n";

/// Upper bound on request headers per request.
pub const MAX_NUMBER_OF_HEADERS: usize = 100;

// ── Header names ──
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const AUTHORIZATION: &str = "Authorization";
pub const COOKIE: &str = "Cookie";
pub const CONNECTION: &str = "Connection";

/// Cookie carrying the user secret when no `Authorization` header is sent.
pub const AUTHORIZATION_COOKIE: &str = "authorization";

// ── Service paths ──
pub const READ_PATH: &str = "/read";
pub const WRITE_PATH: &str = "/write";
pub const DOWNLOAD_PATH: &str = "/download";

/// Status text for the codes this system emits.
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        307 => "Temporary Redirect",
        401 => "Unauthorized",
        404 => "File Not Found",
        _ => "Internal Error",
    }
}

/// Content type for a downloaded file, keyed on its extension.
pub fn guess_content_type(file_name: &str) -> &'static str {
    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
