// src/conn.rs
//
// Per-fd connection record and its read / parse / respond / write state
// machine. One-shot epoll registration guarantees a single thread works a
// connection between two notifications; the `improv` / `timer_flag` pair is
// the only cross-thread signal and lives on the shared handle, outside the
// record itself.

use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use log::{debug, error, info};

use crate::config::TriggerMode;
use crate::http::{
    self, Body, RequestStatus, CONTINUE_PREAMBLE, MAX_BODY_SIZE, READ_BUFFER_SIZE,
    WRITE_BUFFER_SIZE,
};
use crate::pages;
use crate::parser::{ParseStep, RequestParser};
use crate::routes;
use crate::server::ServerCtx;
use crate::syscalls::{self, ReadOutcome, WriteOutcome};
use crate::util;

/// Shared wrapper handed to the worker queue. Workers store the flags with
/// release ordering; the reactor polls them with acquire.
pub struct ConnHandle {
    pub conn: Mutex<Connection>,
    pub improv: AtomicBool,
    pub timer_flag: AtomicBool,
}

impl ConnHandle {
    pub fn new(conn: Connection) -> Arc<Self> {
        Arc::new(Self {
            conn: Mutex::new(conn),
            improv: AtomicBool::new(false),
            timer_flag: AtomicBool::new(false),
        })
    }
}

pub struct Connection {
    pub fd: RawFd,
    /// Normalized peer key in the IP registry (`local` for private ranges).
    pub ip: String,
    trig_mode: TriggerMode,
    pub parser: RequestParser,
    pub read_buf: Vec<u8>,
    pub read_idx: usize,
    header_buf: Vec<u8>,
    pub body: Body,
    pub response_status: u16,
    /// MIME of a file-backed response.
    pub content_type: String,
    /// MIME of an owned-bytes response; wins over `content_type` when set.
    pub dynamic_content_type: Option<String>,
    pub extra_headers: String,
    /// Session user resolved from the `ws_user` cookie (or a fresh login).
    pub username: String,
    bytes_to_send: usize,
    bytes_have_send: usize,
    sent_continue: bool,
}

impl Connection {
    pub fn new(fd: RawFd, ip: String, trig_mode: TriggerMode) -> Self {
        Self {
            fd,
            ip,
            trig_mode,
            parser: RequestParser::new(),
            read_buf: vec![0; READ_BUFFER_SIZE],
            read_idx: 0,
            header_buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            body: Body::None,
            response_status: 200,
            content_type: "text/html; charset=utf-8".to_string(),
            dynamic_content_type: None,
            extra_headers: String::new(),
            username: String::new(),
            bytes_to_send: 0,
            bytes_have_send: 0,
            sent_continue: false,
        }
    }

    /// Reset all per-request state for the next request on the same socket.
    pub fn reset_request(&mut self) {
        self.parser.reset();
        self.read_buf.clear();
        self.read_buf.resize(READ_BUFFER_SIZE, 0);
        self.read_idx = 0;
        self.header_buf.clear();
        self.body = Body::None;
        self.response_status = 200;
        self.content_type = "text/html; charset=utf-8".to_string();
        self.dynamic_content_type = None;
        self.extra_headers.clear();
        self.username.clear();
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
        self.sent_continue = false;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    /// Drain the socket into the read buffer, growing it on demand. Returns
    /// false on EOF, connection reset, or a dead buffer cap.
    pub fn read_once(&mut self) -> bool {
        loop {
            if self.read_idx >= self.read_buf.len() && !self.grow_read_buffer() {
                error!("fd {}: read buffer cap reached at {}", self.fd, self.read_idx);
                return false;
            }
            match syscalls::read_socket(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(ReadOutcome::Data(n)) => self.read_idx += n,
                Ok(ReadOutcome::WouldBlock) => return true,
                Ok(ReadOutcome::Eof) => return false,
                Err(err) => {
                    debug!("fd {}: recv failed: {}", self.fd, err);
                    return false;
                }
            }
        }
    }

    fn grow_read_buffer(&mut self) -> bool {
        let cap = MAX_BODY_SIZE + 4096;
        let current = self.read_buf.len();
        if current >= cap {
            return false;
        }
        let next = (current * 2).max(current + 4096).min(cap);
        self.read_buf.resize(next, 0);
        true
    }

    /// Parse what has arrived and dispatch once the request is complete.
    fn process_read(&mut self, ctx: &ServerCtx, db: &rusqlite::Connection) -> RequestStatus {
        let step = self.parser.parse(&self.read_buf, self.read_idx);

        if self.parser.expects_continue && !self.sent_continue {
            syscalls::send_best_effort(self.fd, CONTINUE_PREAMBLE);
            self.sent_continue = true;
        }
        if let Some(raw) = self.parser.forwarded_ip.take() {
            self.update_client_ip(ctx, &raw);
        }

        match step {
            ParseStep::NeedMore => {
                // A known body length pre-grows the buffer a step so the next
                // recv has room.
                if self.parser.content_length > 0 {
                    let needed =
                        (self.parser.content_length + 4096).min(READ_BUFFER_SIZE * 2);
                    if needed > self.read_buf.len() {
                        self.read_buf.resize(needed, 0);
                    }
                }
                RequestStatus::NeedMore
            }
            ParseStep::Bad => RequestStatus::BadRequest,
            ParseStep::TooLarge => {
                self.set_dynamic(413, "text/html; charset=utf-8", pages::payload_too_large());
                RequestStatus::Dynamic
            }
            ParseStep::Done => routes::dispatch(self, ctx, db),
        }
    }

    /// A trusted forwarding header replaces the peer in the IP registry.
    fn update_client_ip(&mut self, ctx: &ServerCtx, raw: &str) {
        let normalized = util::normalize_client_ip(raw);
        if normalized.is_empty() || normalized == self.ip {
            return;
        }
        ctx.stats.replace_ip(&self.ip, &normalized);
        self.ip = normalized;
    }

    /// Owned-bytes response shorthand used by the dynamic routes.
    pub fn set_dynamic(&mut self, status: u16, content_type: &str, body: String) {
        self.response_status = status;
        self.dynamic_content_type = Some(content_type.to_string());
        self.body = Body::Owned(body.into_bytes());
    }

    pub fn body_range(&self) -> Option<(usize, usize)> {
        self.parser.body
    }

    /// Full request pipeline for one readiness notification: parse,
    /// dispatch, assemble. Returns false when more bytes are needed (the
    /// connection is re-armed for read), true when a response is staged (or
    /// the connection died trying).
    pub fn process(&mut self, ctx: &ServerCtx, db: &rusqlite::Connection) -> bool {
        let status = self.process_read(ctx, db);
        if status == RequestStatus::NeedMore {
            self.rearm(ctx, libc::EPOLLIN as u32);
            return false;
        }
        ctx.stats.record_request();
        if !self.process_write(status) {
            error!("fd {}: response assembly failed", self.fd);
            self.close(ctx);
            return true;
        }
        self.rearm(ctx, libc::EPOLLOUT as u32);
        true
    }

    // ---- Response assembly ----

    fn add(&mut self, text: &str) -> bool {
        if self.header_buf.len() + text.len() >= WRITE_BUFFER_SIZE {
            return false;
        }
        self.header_buf.extend_from_slice(text.as_bytes());
        true
    }

    fn add_status_line(&mut self, status: u16) -> bool {
        self.add(&format!(
            "HTTP/1.1 {} {}\r\n",
            status,
            http::status_title(status)
        ))
    }

    fn add_headers(&mut self, content_length: usize) -> bool {
        let extra = self.extra_headers.clone();
        let content_type = self
            .dynamic_content_type
            .clone()
            .unwrap_or_else(|| self.content_type.clone());
        let linger = if self.parser.linger { "keep-alive" } else { "close" };
        self.add(&format!("Content-Length:{}\r\n", content_length))
            && (extra.is_empty() || self.add(&extra))
            && self.add(&format!("Content-Type:{}\r\n", content_type))
            && self.add(&format!("Connection:{}\r\n", linger))
            && self.add("\r\n")
    }

    fn canned(&mut self, status: u16, body: &str) -> bool {
        self.body = Body::None;
        self.add_status_line(status) && self.add_headers(body.len()) && self.add(body)
    }

    /// Stage the response: fill the header buffer and pick the two-slice
    /// write shape. The body slot already holds the mmap/owned payload.
    pub fn process_write(&mut self, status: RequestStatus) -> bool {
        self.header_buf.clear();
        let ok = match status {
            RequestStatus::InternalError => self.canned(500, http::ERROR_500_BODY),
            RequestStatus::BadRequest => self.canned(400, http::ERROR_400_BODY),
            RequestStatus::NotFound => self.canned(404, http::ERROR_404_BODY),
            RequestStatus::Forbidden => self.canned(403, http::ERROR_403_BODY),
            RequestStatus::Dynamic | RequestStatus::Subprocess => {
                let len = self.body.len();
                let status_code = self.response_status;
                self.add_status_line(status_code) && self.add_headers(len)
            }
            RequestStatus::File => {
                if self.body.is_empty() {
                    self.body = Body::None;
                    self.add_status_line(200)
                        && self.add_headers(http::EMPTY_FILE_BODY.len())
                        && self.add(http::EMPTY_FILE_BODY)
                } else {
                    let len = self.body.len();
                    self.add_status_line(200) && self.add_headers(len)
                }
            }
            RequestStatus::NeedMore => false,
        };
        if ok {
            self.bytes_have_send = 0;
            self.bytes_to_send = self.header_buf.len() + self.body.len();
        }
        ok
    }

    /// Drain the staged response with vectored writes. Returns true while
    /// the connection should stay registered (paused on EAGAIN or reset for
    /// keep-alive), false when it must be closed.
    pub fn write(&mut self, ctx: &ServerCtx) -> bool {
        if self.bytes_to_send == 0 {
            self.rearm(ctx, libc::EPOLLIN as u32);
            self.reset_request();
            return true;
        }
        loop {
            let header_sent = self.bytes_have_send.min(self.header_buf.len());
            let body_sent = self.bytes_have_send - header_sent;
            let header_rest = &self.header_buf[header_sent..];
            let body_rest = &self.body.as_slice()[body_sent..];
            match syscalls::writev_socket(self.fd, header_rest, body_rest) {
                Ok(WriteOutcome::Wrote(n)) => {
                    self.bytes_have_send += n;
                    self.bytes_to_send -= n.min(self.bytes_to_send);
                    if self.bytes_to_send == 0 {
                        // Unmap or free the body before the next request.
                        self.body = Body::None;
                        let linger = self.parser.linger;
                        self.rearm(ctx, libc::EPOLLIN as u32);
                        if linger {
                            self.reset_request();
                            return true;
                        }
                        return false;
                    }
                }
                Ok(WriteOutcome::WouldBlock) => {
                    self.rearm(ctx, libc::EPOLLOUT as u32);
                    return true;
                }
                Err(err) => {
                    debug!("fd {}: writev failed: {}", self.fd, err);
                    self.body = Body::None;
                    return false;
                }
            }
        }
    }

    /// Re-subscribe this fd with one-shot; the next notification checks the
    /// connection out to exactly one thread again.
    fn rearm(&self, ctx: &ServerCtx, base: u32) {
        if self.fd < 0 {
            return;
        }
        let events = syscalls::interest(base, self.trig_mode, true);
        if let Err(err) = ctx.epoll.modify(self.fd, self.fd as u64, events) {
            debug!("fd {}: epoll rearm failed: {}", self.fd, err);
        }
    }

    /// Tear the connection down: registry decrement, epoll removal, close.
    /// Idempotent; the timer callback and a worker error path may race here.
    pub fn close(&mut self, ctx: &ServerCtx) {
        if self.fd < 0 {
            return;
        }
        info!("close fd {}", self.fd);
        ctx.stats.on_disconnect(&self.ip);
        let _ = ctx.epoll.delete(self.fd);
        syscalls::close_fd(self.fd);
        self.fd = -1;
        self.body = Body::None;
    }

    /// Staged response head: status line, headers, and, for the canned
    /// error shapes, the inline body.
    pub fn response_head(&self) -> &[u8] {
        &self.header_buf
    }

    #[cfg(test)]
    fn header_text(&self) -> String {
        String::from_utf8_lossy(&self.header_buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        Connection::new(-1, "local".to_string(), TriggerMode::Level)
    }

    #[test]
    fn canned_404_fits_in_header_buffer() {
        let mut conn = test_conn();
        assert!(conn.process_write(RequestStatus::NotFound));
        let text = conn.header_text();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains(&format!("Content-Length:{}\r\n", http::ERROR_404_BODY.len())));
        assert!(text.contains("Connection:close\r\n"));
        assert!(text.ends_with(http::ERROR_404_BODY));
        assert_eq!(conn.body.len(), 0);
    }

    #[test]
    fn dynamic_response_uses_two_slices() {
        let mut conn = test_conn();
        conn.set_dynamic(200, "application/json; charset=utf-8", "{\"ok\":true}".into());
        assert!(conn.process_write(RequestStatus::Dynamic));
        let text = conn.header_text();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length:11\r\n"));
        assert!(text.contains("Content-Type:application/json; charset=utf-8\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(conn.body.as_slice(), b"{\"ok\":true}");
    }

    #[test]
    fn extra_headers_ride_between_length_and_type() {
        let mut conn = test_conn();
        conn.extra_headers
            .push_str("Set-Cookie: ws_user=alice; Path=/\r\n");
        conn.set_dynamic(302, "text/html; charset=utf-8", "<p>bye</p>".into());
        assert!(conn.process_write(RequestStatus::Dynamic));
        let text = conn.header_text();
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
        let cookie_pos = text.find("Set-Cookie").unwrap();
        let type_pos = text.find("Content-Type").unwrap();
        assert!(cookie_pos < type_pos);
    }

    #[test]
    fn keep_alive_flag_sets_connection_header() {
        let mut conn = test_conn();
        conn.parser.linger = true;
        assert!(conn.process_write(RequestStatus::NotFound));
        assert!(conn.header_text().contains("Connection:keep-alive\r\n"));
    }

    #[test]
    fn empty_file_gets_placeholder_body() {
        let mut conn = test_conn();
        conn.body = Body::None;
        assert!(conn.process_write(RequestStatus::File));
        let text = conn.header_text();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with(http::EMPTY_FILE_BODY));
    }

    #[test]
    fn oversized_header_assembly_fails_cleanly() {
        let mut conn = test_conn();
        conn.extra_headers = format!("X-Big: {}\r\n", "y".repeat(WRITE_BUFFER_SIZE));
        assert!(!conn.process_write(RequestStatus::NotFound));
    }

    #[test]
    fn read_buffer_growth_is_capped() {
        let mut conn = test_conn();
        assert_eq!(conn.read_buf.len(), READ_BUFFER_SIZE);
        while conn.grow_read_buffer() {}
        assert_eq!(conn.read_buf.len(), MAX_BODY_SIZE + 4096);
    }
}
