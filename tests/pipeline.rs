// tests/pipeline.rs
//
// End-to-end exercises of the request pipeline: bytes go into a
// connection's read buffer, `process` parses and dispatches against a real
// webroot and database, and the staged response (and, where a socket pair
// is involved, the actual written bytes) is checked.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use ravel::config::TriggerMode;
use ravel::conn::Connection;
use ravel::db::{self, DbPool};
use ravel::http::Body;
use ravel::server::ServerCtx;
use ravel::syscalls::{self, ReadOutcome};
use ravel::uploads;

struct TestServer {
    _dir: tempfile::TempDir,
    webroot: PathBuf,
    ctx: ServerCtx,
    db: DbPool,
}

fn write_page(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    // umask-proof: static serving requires world-readable files
    fs::set_permissions(path, fs::Permissions::from_mode(0o644)).unwrap();
}

fn setup() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let webroot = dir.path().join("webroot");
    fs::create_dir_all(webroot.join("pages")).unwrap();
    for d in [&webroot, &webroot.join("pages")] {
        fs::set_permissions(d, fs::Permissions::from_mode(0o755)).unwrap();
    }
    write_page(&webroot.join("index.html"), "<h1>ravel home</h1>");
    write_page(&webroot.join("pages/log.html"), "<h1>sign in</h1>");
    write_page(&webroot.join("pages/register.html"), "<h1>register</h1>");
    write_page(&webroot.join("pages/logError.html"), "<h1>bad credentials</h1>");
    write_page(
        &webroot.join("pages/registerError.html"),
        "<h1>name taken</h1>",
    );
    write_page(&webroot.join("pages/upload.html"), "<h1>upload</h1>");

    let db = DbPool::open(&dir.path().join("data.db"), 2).unwrap();
    {
        let conn = db.acquire();
        db::insert_user(&conn, "testuser", "testpass123").unwrap();
    }
    let ctx = ServerCtx::new(webroot.clone(), db.clone(), TriggerMode::Level).unwrap();
    TestServer {
        _dir: dir,
        webroot,
        ctx,
        db,
    }
}

fn feed(conn: &mut Connection, raw: &[u8]) {
    if raw.len() > conn.read_buf.len() {
        conn.read_buf.resize(raw.len(), 0);
    }
    conn.read_buf[..raw.len()].copy_from_slice(raw);
    conn.read_idx = raw.len();
}

/// Run one complete request through parse + dispatch + response assembly.
fn run(ts: &TestServer, raw: &[u8]) -> (Connection, String) {
    let mut conn = Connection::new(-1, "local".to_string(), TriggerMode::Level);
    feed(&mut conn, raw);
    let dbh = ts.db.acquire();
    let done = conn.process(&ts.ctx, &dbh);
    assert!(done, "request did not complete");
    let head = String::from_utf8_lossy(conn.response_head()).into_owned();
    (conn, head)
}

#[test]
fn root_get_serves_index_html() {
    let ts = setup();
    let (conn, head) = run(&ts, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let index = fs::read(ts.webroot.join("index.html")).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains(&format!("Content-Length:{}\r\n", index.len())));
    assert!(head.contains("Content-Type:text/html; charset=utf-8\r\n"));
    assert!(head.contains("Connection:close\r\n"));
    assert_eq!(conn.body.as_slice(), index.as_slice());
    assert!(matches!(conn.body, Body::Mmapped(_)));
}

#[test]
fn keep_alive_request_keeps_connection_header() {
    let ts = setup();
    let (_, head) = run(
        &ts,
        b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
    );
    assert!(head.contains("Connection:keep-alive\r\n"));
}

#[test]
fn login_success_sets_cookie_and_renders_welcome() {
    let ts = setup();
    let body = "user=testuser&password=testpass123";
    let req = format!(
        "POST /2login HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n{}",
        body.len(),
        body
    );
    let (conn, head) = run(&ts, req.as_bytes());
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Set-Cookie: ws_user=testuser; Path=/\r\n"));
    let page = String::from_utf8_lossy(conn.body.as_slice()).into_owned();
    assert!(page.contains("Welcome back, testuser"));
}

#[test]
fn login_failure_lands_on_error_page() {
    let ts = setup();
    let body = "user=testuser&password=wrong";
    let req = format!(
        "POST /2login HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let (conn, head) = run(&ts, req.as_bytes());
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!head.contains("Set-Cookie: ws_user=testuser"));
    let error_page = fs::read(ts.webroot.join("pages/logError.html")).unwrap();
    assert_eq!(conn.body.as_slice(), error_page.as_slice());
}

#[test]
fn register_inserts_user_then_rejects_duplicate() {
    let ts = setup();
    let body = "user=newuser&password=pw123";
    let req = format!(
        "POST /3register HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let (conn, head) = run(&ts, req.as_bytes());
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    let login_page = fs::read(ts.webroot.join("pages/log.html")).unwrap();
    assert_eq!(conn.body.as_slice(), login_page.as_slice());

    // the new account is durable and immediately usable
    assert_eq!(
        ts.db.load_users().unwrap().get("newuser").map(String::as_str),
        Some("pw123")
    );

    let (conn, _) = run(&ts, req.as_bytes());
    let error_page = fs::read(ts.webroot.join("pages/registerError.html")).unwrap();
    assert_eq!(conn.body.as_slice(), error_page.as_slice());
}

#[test]
fn status_json_requires_login_and_reports_counters() {
    let ts = setup();
    let (_, head) = run(&ts, b"GET /status.json HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(head.contains("Location: /pages/log.html\r\n"));

    let (conn, head) = run(
        &ts,
        b"GET /status.json HTTP/1.1\r\nHost: x\r\nCookie: ws_user=testuser\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type:application/json; charset=utf-8\r\n"));
    assert!(head.contains("Cache-Control: no-store, no-cache, must-revalidate\r\n"));
    assert!(head.contains("Pragma: no-cache\r\n"));

    let value: serde_json::Value = serde_json::from_slice(conn.body.as_slice()).unwrap();
    for field in [
        "uptime_seconds",
        "online_users",
        "online_connections",
        "total_unique_visitors",
        "total_requests",
        "avg_qps",
        "server_time",
    ] {
        assert!(value.get(field).is_some(), "missing {}", field);
    }
    assert!(value["total_requests"].as_u64().unwrap() >= 1);
}

fn multipart_body(boundary: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

#[test]
fn upload_store_fetch_delete_cycle() {
    let ts = setup();
    let data = b"\x89PNG fake image bytes \x00\x01\x02";
    let body = multipart_body("xyzBoundary42", "photo.png", data);
    let req_head = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\nCookie: ws_user=testuser\r\nContent-Type: multipart/form-data; boundary=xyzBoundary42\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut raw = req_head.into_bytes();
    raw.extend_from_slice(&body);

    let (conn, head) = run(&ts, &raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    let page = String::from_utf8_lossy(conn.body.as_slice()).into_owned();
    assert!(page.contains("Upload complete"));

    let items = uploads::load(&ts.webroot, "testuser");
    assert_eq!(items.len(), 1);
    let stored = items[0].stored_name.clone();
    assert!(stored.starts_with("testuser_"));
    assert!(stored.ends_with("_photo.png"));
    assert_eq!(items[0].size, data.len() as u64);
    assert_eq!(
        fs::read(ts.webroot.join("uploads").join(&stored)).unwrap(),
        data
    );

    // listing embeds the stored blob inline
    let (conn, _) = run(
        &ts,
        b"GET /uploads/list HTTP/1.1\r\nHost: x\r\nCookie: ws_user=testuser\r\n\r\n",
    );
    let listing = String::from_utf8_lossy(conn.body.as_slice()).into_owned();
    assert!(listing.contains(&format!("/uploads/{}", stored)));
    assert!(listing.contains("photo.png"));

    // the blob resolves for its owner
    let fetch = format!(
        "GET /uploads/{} HTTP/1.1\r\nHost: x\r\nCookie: ws_user=testuser\r\n\r\n",
        stored
    );
    let (conn, head) = run(&ts, fetch.as_bytes());
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(conn.body.as_slice(), data);

    // but not for another account
    {
        let dbh = ts.db.acquire();
        db::insert_user(&dbh, "other", "pw").unwrap();
    }
    ts.ctx
        .users
        .lock()
        .unwrap()
        .insert("other".to_string(), "pw".to_string());
    let fetch_other = format!(
        "GET /uploads/{} HTTP/1.1\r\nHost: x\r\nCookie: ws_user=other\r\n\r\n",
        stored
    );
    let (_, head) = run(&ts, fetch_other.as_bytes());
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    // delete rewrites the metadata and removes the blob
    let del_body = format!("file={}", stored);
    let del = format!(
        "POST /uploads/delete HTTP/1.1\r\nHost: x\r\nCookie: ws_user=testuser\r\nContent-Length: {}\r\n\r\n{}",
        del_body.len(),
        del_body
    );
    let (conn, head) = run(&ts, del.as_bytes());
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    let page = String::from_utf8_lossy(conn.body.as_slice()).into_owned();
    assert!(page.contains("Delete complete"));
    assert!(uploads::load(&ts.webroot, "testuser").is_empty());
    assert!(!ts.webroot.join("uploads").join(&stored).exists());

    let (_, head) = run(&ts, fetch.as_bytes());
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn oversize_content_length_draws_413_without_allocation() {
    let ts = setup();
    let req = b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 300000000\r\nContent-Type: multipart/form-data; boundary=zz\r\n\r\n";
    let (conn, head) = run(&ts, req);
    assert!(head.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    // the read buffer never grew toward the announced size
    assert!(conn.read_buf.len() < 1024 * 1024);
}

#[test]
fn traversal_and_malformed_paths_are_rejected() {
    let ts = setup();
    let (_, head) = run(&ts, b"GET /../secret HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    let (_, head) = run(&ts, b"GET /a%2e%2e/b HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn directory_request_is_bad_request() {
    let ts = setup();
    let (_, head) = run(&ts, b"GET /pages HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn unreadable_file_is_forbidden() {
    let ts = setup();
    let secret = ts.webroot.join("secret.html");
    fs::write(&secret, "top secret").unwrap();
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();
    let (_, head) = run(&ts, b"GET /secret.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
}

#[test]
fn missing_file_uses_custom_404_page_when_present() {
    let ts = setup();
    let (_, head) = run(&ts, b"GET /nope.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    write_page(&ts.webroot.join("404.html"), "<h1>custom not found</h1>");
    let (conn, head) = run(&ts, b"GET /nope.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(conn.body.as_slice(), b"<h1>custom not found</h1>");
}

#[test]
fn aliases_route_to_pages_directory() {
    let ts = setup();
    let (conn, head) = run(&ts, b"GET /register.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    let page = fs::read(ts.webroot.join("pages/register.html")).unwrap();
    assert_eq!(conn.body.as_slice(), page.as_slice());

    // single-digit shorthand
    let (conn, _) = run(&ts, b"GET /1 HTTP/1.1\r\nHost: x\r\n\r\n");
    let page = fs::read(ts.webroot.join("pages/log.html")).unwrap();
    assert_eq!(conn.body.as_slice(), page.as_slice());
}

#[test]
fn protected_pages_redirect_anonymous_visitors() {
    let ts = setup();
    for url in ["/pages/upload.html", "/pages/welcome.html", "/uploads/list", "/upload"] {
        let req = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", url);
        let (_, head) = run(&ts, req.as_bytes());
        assert!(
            head.starts_with("HTTP/1.1 302 Found\r\n"),
            "{} should redirect, got {}",
            url,
            head.lines().next().unwrap_or("")
        );
    }
}

#[test]
fn stale_session_cookie_is_cleared() {
    let ts = setup();
    let (_, head) = run(&ts, b"GET / HTTP/1.1\r\nHost: x\r\nCookie: ws_user=ghost\r\n\r\n");
    assert!(head.contains("Set-Cookie: ws_user=; Path=/; Max-Age=0\r\n"));
}

#[test]
fn logout_clears_cookie_and_redirects() {
    let ts = setup();
    let (_, head) = run(
        &ts,
        b"GET /logout HTTP/1.1\r\nHost: x\r\nCookie: ws_user=testuser\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(head.contains("Set-Cookie: ws_user=; Path=/; Max-Age=0\r\n"));
    assert!(head.contains("Location: /pages/log.html\r\n"));
}

/// Drive a staged response through a real socket with the vectored write
/// path, twice on the same connection for keep-alive.
#[test]
fn write_drains_response_and_keep_alive_resets() {
    let ts = setup();
    let (client, server_fd) = syscalls::socket_pair().unwrap();
    let mut conn = Connection::new(server_fd, "local".to_string(), TriggerMode::Level);

    let index = fs::read(ts.webroot.join("index.html")).unwrap();
    for round in 0..2 {
        let req = b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";
        feed(&mut conn, req);
        {
            let dbh = ts.db.acquire();
            assert!(conn.process(&ts.ctx, &dbh));
        }
        let expected = conn.response_head().len() + conn.body.len();
        assert!(conn.write(&ts.ctx), "keep-alive write should keep the connection");

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while received.len() < expected {
            match syscalls::read_socket(client, &mut buf).unwrap() {
                ReadOutcome::Data(n) => received.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        let text = String::from_utf8_lossy(&received).into_owned();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "round {}", round);
        assert!(received.ends_with(&index), "round {}", round);

        // reset left the connection ready for the next request
        assert_eq!(conn.read_idx, 0);
        assert!(conn.response_head().is_empty());
    }

    syscalls::close_fd(client);
    syscalls::close_fd(server_fd);
}
