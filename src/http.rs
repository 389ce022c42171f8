// src/http.rs
use memmap2::Mmap;

/// Largest request body the parser will accept; anything above draws a 413.
pub const MAX_BODY_SIZE: usize = 200 * 1024 * 1024;

/// Initial read buffer per connection; grows by doubling up to
/// `MAX_BODY_SIZE + 4096`.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Fixed response header buffer; header assembly fails past this.
pub const WRITE_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case("POST") {
            Some(Method::Post)
        } else {
            None
        }
    }
}

/// Outcome of parsing + dispatch; `process_write` picks the response shape
/// from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// More bytes are needed; re-arm for read.
    NeedMore,
    BadRequest,
    NotFound,
    Forbidden,
    InternalError,
    /// Response body is a memory-mapped file.
    File,
    /// Response body is owned process memory.
    Dynamic,
    /// Response body was captured from an interpreter subprocess.
    Subprocess,
}

pub const OK_200_TITLE: &str = "OK";
pub const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_BODY: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_BODY: &str = "You do not have permission to get file from this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_BODY: &str = "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_BODY: &str = "There was an unusual problem serving the request file.\n";

/// Body served for a zero-length static file.
pub const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

pub const CONTINUE_PREAMBLE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

pub fn status_title(status: u16) -> &'static str {
    match status {
        200 => OK_200_TITLE,
        302 => "Found",
        400 => ERROR_400_TITLE,
        403 => ERROR_403_TITLE,
        404 => ERROR_404_TITLE,
        413 => "Payload Too Large",
        _ => ERROR_500_TITLE,
    }
}

/// MIME type by file extension; unknown extensions fall back to an opaque
/// octet stream.
pub fn mime_for_path(path: &str) -> &'static str {
    let ext = match path.rfind('.') {
        Some(idx) => path[idx..].to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        ".html" | ".htm" => "text/html; charset=utf-8",
        ".css" => "text/css; charset=utf-8",
        ".js" => "application/javascript; charset=utf-8",
        ".json" => "application/json; charset=utf-8",
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".svg" => "image/svg+xml",
        ".ico" => "image/x-icon",
        ".mp4" => "video/mp4",
        ".webm" => "video/webm",
        ".ogg" => "video/ogg",
        ".pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Response body ownership: a memory-mapped file slice, an owned buffer, or
/// nothing. Unmap vs free vs no-op at cleanup is a total match on this.
#[derive(Default)]
pub enum Body {
    Mmapped(Mmap),
    Owned(Vec<u8>),
    #[default]
    None,
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Mmapped(map) => map.len(),
            Body::Owned(bytes) => bytes.len(),
            Body::None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Body::Mmapped(map) => &map[..],
            Body::Owned(bytes) => bytes.as_slice(),
            Body::None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_table_covers_known_extensions() {
        assert_eq!(mime_for_path("/index.html"), "text/html; charset=utf-8");
        assert_eq!(mime_for_path("/a/b.HTM"), "text/html; charset=utf-8");
        assert_eq!(mime_for_path("/site.css"), "text/css; charset=utf-8");
        assert_eq!(mime_for_path("/x.jpeg"), "image/jpeg");
        assert_eq!(mime_for_path("/clip.webm"), "video/webm");
        assert_eq!(mime_for_path("/doc.pdf"), "application/pdf");
        assert_eq!(mime_for_path("/raw.bin"), "application/octet-stream");
        assert_eq!(mime_for_path("/noext"), "application/octet-stream");
    }

    #[test]
    fn method_tokens() {
        assert_eq!(Method::from_token("GET"), Some(Method::Get));
        assert_eq!(Method::from_token("post"), Some(Method::Post));
        assert_eq!(Method::from_token("PUT"), None);
        assert_eq!(Method::from_token(""), None);
    }

    #[test]
    fn body_len_follows_variant() {
        assert_eq!(Body::None.len(), 0);
        assert!(Body::None.is_empty());
        let owned = Body::Owned(b"abc".to_vec());
        assert_eq!(owned.len(), 3);
        assert_eq!(owned.as_slice(), b"abc");
    }
}
