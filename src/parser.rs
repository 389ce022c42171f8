// src/parser.rs
//
// Incremental HTTP/1.1 request parser. It walks the connection's read buffer
// with a `checked` cursor, consuming CRLF-terminated lines for the request
// line and headers, then waits for `content_length` raw bytes of body. The
// buffer is owned by the connection; the parser only keeps cursors into it,
// so a partially received request picks up exactly where the last recv left
// off.

use log::info;

use crate::http::{Method, MAX_BODY_SIZE};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Ok,
    Open,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Headers,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStep {
    /// Request incomplete; feed more bytes.
    NeedMore,
    /// A full request (line, headers, body) has been consumed.
    Done,
    /// Malformed request line, header framing, or unsupported method.
    Bad,
    /// Announced Content-Length exceeds the body cap.
    TooLarge,
}

enum HeaderOutcome {
    Handled,
    TooLarge,
}

pub struct RequestParser {
    pub state: CheckState,
    checked: usize,
    start_line: usize,
    line_end: usize,
    pub method: Method,
    pub url: String,
    pub host: Option<String>,
    pub cookie: Option<String>,
    pub linger: bool,
    pub content_length: usize,
    pub boundary: Option<String>,
    pub forwarded_ip: Option<String>,
    pub expects_continue: bool,
    pub body: Option<(usize, usize)>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: CheckState::RequestLine,
            checked: 0,
            start_line: 0,
            line_end: 0,
            method: Method::Get,
            url: String::new(),
            host: None,
            cookie: None,
            linger: false,
            content_length: 0,
            boundary: None,
            forwarded_ip: None,
            expects_continue: false,
            body: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Advance over `buf[..read_idx]`. Safe to call repeatedly as bytes
    /// arrive; cursors persist between calls.
    pub fn parse(&mut self, buf: &[u8], read_idx: usize) -> ParseStep {
        loop {
            if self.state == CheckState::Content {
                return self.check_body(read_idx);
            }
            match self.parse_line(buf, read_idx) {
                LineStatus::Open => return ParseStep::NeedMore,
                LineStatus::Bad => return ParseStep::Bad,
                LineStatus::Ok => {}
            }
            let line =
                String::from_utf8_lossy(&buf[self.start_line..self.line_end]).into_owned();
            self.start_line = self.checked;

            if self.state == CheckState::RequestLine {
                if !self.parse_request_line(&line) {
                    return ParseStep::Bad;
                }
                self.state = CheckState::Headers;
            } else if line.is_empty() {
                if self.content_length > 0 {
                    self.state = CheckState::Content;
                    continue;
                }
                return ParseStep::Done;
            } else if let HeaderOutcome::TooLarge = self.parse_header(&line) {
                return ParseStep::TooLarge;
            }
        }
    }

    /// Line scanner: CRLF terminates a line; a bare LF is accepted only when
    /// the preceding byte is CR (the CR arrived in an earlier recv). A CR
    /// followed by anything but LF is malformed.
    fn parse_line(&mut self, buf: &[u8], read_idx: usize) -> LineStatus {
        while self.checked < read_idx {
            match buf[self.checked] {
                b'\r' => {
                    if self.checked + 1 == read_idx {
                        return LineStatus::Open;
                    }
                    if buf[self.checked + 1] == b'\n' {
                        self.line_end = self.checked;
                        self.checked += 2;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if self.checked > 1 && buf[self.checked - 1] == b'\r' {
                        self.line_end = self.checked - 1;
                        self.checked += 1;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                _ => self.checked += 1,
            }
        }
        LineStatus::Open
    }

    fn check_body(&mut self, read_idx: usize) -> ParseStep {
        let needed = self.start_line + self.content_length;
        if read_idx >= needed {
            self.body = Some((self.start_line, self.content_length));
            ParseStep::Done
        } else {
            ParseStep::NeedMore
        }
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        let blank = &[' ', '\t'][..];
        let sp1 = match line.find(blank) {
            Some(idx) => idx,
            None => return false,
        };
        let method = match Method::from_token(&line[..sp1]) {
            Some(method) => method,
            None => return false,
        };
        let rest = line[sp1..].trim_start_matches(blank);
        let sp2 = match rest.find(blank) {
            Some(idx) => idx,
            None => return false,
        };
        let mut url = &rest[..sp2];
        let version = rest[sp2..].trim_start_matches(blank);
        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return false;
        }

        for prefix_len in [7usize, 8] {
            let prefix = if prefix_len == 7 { "http://" } else { "https://" };
            if url.len() >= prefix_len && url[..prefix_len].eq_ignore_ascii_case(prefix) {
                match url[prefix_len..].find('/') {
                    Some(slash) => url = &url[prefix_len + slash..],
                    None => return false,
                }
            }
        }
        if !url.starts_with('/') {
            return false;
        }
        self.method = method;
        self.url = if url == "/" {
            "/index.html".to_string()
        } else {
            url.to_string()
        };
        true
    }

    fn parse_header(&mut self, line: &str) -> HeaderOutcome {
        if let Some(value) = header_value(line, "Connection:") {
            if value.eq_ignore_ascii_case("keep-alive") {
                self.linger = true;
            }
        } else if let Some(value) = header_value(line, "Content-Length:") {
            self.content_length = leading_number(value);
            if self.content_length > MAX_BODY_SIZE {
                return HeaderOutcome::TooLarge;
            }
        } else if let Some(value) = header_value(line, "Expect:") {
            if value.to_ascii_lowercase().contains("100-continue") {
                self.expects_continue = true;
            }
        } else if let Some(value) = header_value(line, "Content-Type:") {
            if let Some(boundary) = extract_boundary(value) {
                self.boundary = Some(boundary);
            }
        } else if let Some(value) = header_value(line, "Host:") {
            self.host = Some(value.to_string());
        } else if let Some(value) = header_value(line, "Cookie:") {
            self.cookie = Some(value.to_string());
        } else if let Some(value) = header_value(line, "X-Forwarded-For:")
            .or_else(|| header_value(line, "CF-Connecting-IP:"))
        {
            let ip = util::extract_forwarded_ip(value);
            if !ip.is_empty() {
                self.forwarded_ip = Some(ip);
            }
        } else {
            info!("unknown header: {}", line);
        }
        HeaderOutcome::Handled
    }
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name) {
        Some(line[name.len()..].trim_start_matches([' ', '\t']))
    } else {
        None
    }
}

/// Leading-digit parse, zero when the value starts with anything else.
fn leading_number(value: &str) -> usize {
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// `boundary=` parameter of a multipart Content-Type, quotes stripped.
fn extract_boundary(value: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let start = lower.find("boundary=")? + "boundary=".len();
    let rest = &value[start..];
    let raw = match rest.find(';') {
        Some(end) => &rest[..end],
        None => rest,
    };
    let trimmed = raw.trim();
    let boundary = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    Some(boundary.to_string())
}
