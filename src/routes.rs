// src/routes.rs
//
// URL dispatch on top of the parser output. The pipeline mirrors the
// browser-facing site: decode and screen the path, apply the alias table,
// resolve the session cookie, run the form handlers, then fall through to
// dynamic pages, the PHP bridge, and finally static files.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;

use log::{error, info, warn};
use memmap2::Mmap;

use crate::conn::Connection;
use crate::db;
use crate::http::{mime_for_path, Body, Method, RequestStatus};
use crate::multipart::Multipart;
use crate::pages;
use crate::server::ServerCtx;
use crate::stats;
use crate::uploads::{self, RemoveOutcome, UploadRecord};
use crate::util;

const HTML_UTF8: &str = "text/html; charset=utf-8";
const SESSION_COOKIE: &str = "ws_user";
const CLEAR_COOKIE: &str = "Set-Cookie: ws_user=; Path=/; Max-Age=0\r\n";

pub fn dispatch(
    conn: &mut Connection,
    ctx: &ServerCtx,
    dbh: &rusqlite::Connection,
) -> RequestStatus {
    let mut url = util::url_decode(&conn.parser.url);
    if url.is_empty() || !url.starts_with('/') {
        return RequestStatus::BadRequest;
    }
    if url.contains("..") {
        return RequestStatus::BadRequest;
    }

    apply_aliases(&mut url);

    let cookie_user = conn
        .parser
        .cookie
        .as_deref()
        .and_then(|header| util::cookie_value(header, SESSION_COOKIE))
        .unwrap_or_default();
    let mut logged_in =
        !cookie_user.is_empty() && ctx.users.lock().unwrap().contains_key(&cookie_user);
    if logged_in {
        conn.username = cookie_user;
    } else if !cookie_user.is_empty() {
        // Stale cookie for an unknown account: tell the browser to drop it.
        conn.extra_headers.push_str(CLEAR_COOKIE);
    }

    // Login (/2...) and register (/3...) form posts rewrite the URL and fall
    // through to whatever page the outcome points at.
    if conn.parser.method == Method::Post
        && url.len() > 1
        && (url.as_bytes()[1] == b'2' || url.as_bytes()[1] == b'3')
    {
        let register = url.as_bytes()[1] == b'3';
        let Some((name, password)) = credentials_from_body(conn) else {
            return RequestStatus::BadRequest;
        };
        url = if register {
            handle_register(ctx, dbh, &name, &password)
        } else if handle_login(ctx, &name, &password) {
            logged_in = true;
            conn.username = name.clone();
            conn.extra_headers.push_str(&format!(
                "Set-Cookie: {}={}; Path=/\r\n",
                SESSION_COOKIE, name
            ));
            "/pages/welcome.html".to_string()
        } else {
            "/pages/logError.html".to_string()
        };
    }

    if url == "/logout" {
        conn.extra_headers.push_str(CLEAR_COOKIE);
        conn.extra_headers.push_str("Location: /pages/log.html\r\n");
        conn.set_dynamic(302, HTML_UTF8, pages::logged_out());
        return RequestStatus::Dynamic;
    }

    if url == "/status.json" {
        if !logged_in {
            return redirect_login(conn);
        }
        return handle_status(conn, &ctx.stats);
    }

    if url == "/upload" {
        if !logged_in {
            return redirect_login(conn);
        }
        if conn.parser.method == Method::Post {
            return handle_upload(conn, ctx);
        }
        url = "/pages/upload.html".to_string();
    }

    if url == "/uploads/delete" {
        if !logged_in {
            return redirect_login(conn);
        }
        return handle_delete(conn, ctx);
    }

    if url == "/uploads/list" {
        if !logged_in {
            return redirect_login(conn);
        }
        let items = uploads::load(&ctx.webroot, &conn.username);
        conn.set_dynamic(200, HTML_UTF8, pages::upload_listing(&items));
        return RequestStatus::Dynamic;
    }

    if let Some(stored) = url.strip_prefix("/uploads/") {
        if !logged_in {
            return redirect_login(conn);
        }
        if stored.is_empty() || !uploads::owns(&ctx.webroot, &conn.username, stored) {
            return render_not_found(conn, ctx);
        }
    }

    if matches!(
        url.as_str(),
        "/pages/status.html" | "/pages/upload.html" | "/pages/welcome.html"
    ) && !logged_in
    {
        return redirect_login(conn);
    }

    if url == "/pages/welcome.html" {
        conn.set_dynamic(200, HTML_UTF8, pages::welcome(&conn.username));
        return RequestStatus::Dynamic;
    }

    if util::file_extension(&url) == ".php" {
        return handle_php(conn, ctx, &url);
    }

    serve_static(conn, ctx, &url)
}

/// Friendly aliases and the single-digit shorthand routes.
fn apply_aliases(url: &mut String) {
    let replacement = match url.as_str() {
        "/register.html" => Some("/pages/register.html"),
        "/log.html" => Some("/pages/log.html"),
        "/welcome.html" => Some("/pages/welcome.html"),
        "/picture.html" | "/video.html" | "/pages/picture.html" | "/pages/video.html" => {
            Some("/uploads/list")
        }
        "/upload.html" => Some("/pages/upload.html"),
        "/status.html" => Some("/pages/status.html"),
        "/0" => Some("/pages/register.html"),
        "/1" => Some("/pages/log.html"),
        "/5" | "/6" => Some("/uploads/list"),
        "/8" => Some("/index.html"),
        "/9" => Some("/404.html"),
        _ => None,
    };
    if let Some(target) = replacement {
        *url = target.to_string();
    }
}

fn credentials_from_body(conn: &Connection) -> Option<(String, String)> {
    let (start, len) = conn.body_range()?;
    let body = String::from_utf8_lossy(&conn.read_buf[start..start + len]).into_owned();
    let name = util::form_value(&body, "user")?;
    let password = util::form_value(&body, "password")?;
    Some((name, password))
}

fn handle_login(ctx: &ServerCtx, name: &str, password: &str) -> bool {
    let users = ctx.users.lock().unwrap();
    users.get(name).map(String::as_str) == Some(password)
}

/// Unseen username: insert into the database and extend the in-memory map
/// under one lock. Returns the page the outcome lands on.
fn handle_register(
    ctx: &ServerCtx,
    dbh: &rusqlite::Connection,
    name: &str,
    password: &str,
) -> String {
    let mut users = ctx.users.lock().unwrap();
    if users.contains_key(name) {
        return "/pages/registerError.html".to_string();
    }
    match db::insert_user(dbh, name, password) {
        Ok(()) => {
            users.insert(name.to_string(), password.to_string());
            info!("registered user {}", name);
            "/pages/log.html".to_string()
        }
        Err(err) => {
            error!("register {} failed: {}", name, err);
            "/pages/registerError.html".to_string()
        }
    }
}

fn redirect_login(conn: &mut Connection) -> RequestStatus {
    conn.extra_headers.push_str("Location: /pages/log.html\r\n");
    conn.set_dynamic(302, HTML_UTF8, pages::login_required());
    RequestStatus::Dynamic
}

fn handle_status(conn: &mut Connection, stats: &stats::Stats) -> RequestStatus {
    let snapshot = stats.snapshot();
    let json = match serde_json::to_string(&snapshot) {
        Ok(json) => json,
        Err(err) => {
            error!("status snapshot serialization failed: {}", err);
            return RequestStatus::InternalError;
        }
    };
    conn.extra_headers
        .push_str("Cache-Control: no-store, no-cache, must-revalidate\r\n");
    conn.extra_headers.push_str("Pragma: no-cache\r\n");
    conn.set_dynamic(200, "application/json; charset=utf-8", json);
    RequestStatus::Dynamic
}

fn upload_fail(conn: &mut Connection, reason: &str) -> RequestStatus {
    conn.set_dynamic(400, HTML_UTF8, pages::upload_failed(reason));
    RequestStatus::Dynamic
}

fn handle_upload(conn: &mut Connection, ctx: &ServerCtx) -> RequestStatus {
    if conn.username.is_empty() {
        return upload_fail(conn, "No signed-in user detected.");
    }
    let Some((start, len)) = conn.body_range() else {
        return upload_fail(conn, "No upload content detected.");
    };
    if len == 0 {
        return upload_fail(conn, "No upload content detected.");
    }

    // Everything that borrows the request body happens here; the response is
    // staged afterwards.
    let stored = {
        let body = &conn.read_buf[start..start + len];
        let multipart = match conn.parser.boundary.as_deref() {
            Some(boundary) => Some(Multipart::new(body, boundary)),
            None => Multipart::detect(body),
        };
        let Some(multipart) = multipart else {
            return upload_fail(conn, "The upload is not a valid multipart body.");
        };

        let mut file_part = None;
        for part in multipart {
            match part {
                Ok(part) if part.filename.is_some() => {
                    file_part = Some(part);
                    break;
                }
                Ok(_) => continue,
                Err(_) => return upload_fail(conn, "The multipart body is incomplete."),
            }
        }
        let Some(part) = file_part else {
            return upload_fail(conn, "No file field found in the upload.");
        };
        if part.body.is_empty() {
            return upload_fail(conn, "The uploaded file is empty.");
        }

        let original = util::sanitize_filename(part.filename.unwrap_or_default());
        let stored_name = uploads::stored_name(&conn.username, &original);
        if let Err(err) = uploads::store_blob(&ctx.webroot, &stored_name, part.body) {
            error!("upload store failed: {}", err);
            return upload_fail(conn, "Could not write the uploaded file.");
        }
        let record = UploadRecord {
            stored_name: stored_name.clone(),
            original_name: original.clone(),
            size: part.body.len() as u64,
            timestamp: stats::unix_now() as i64,
        };
        if let Err(err) = uploads::append_record(&ctx.webroot, &conn.username, &record) {
            warn!("upload metadata append failed: {}", err);
        }
        (original, stored_name, part.body.len())
    };

    let (original, stored_name, size) = stored;
    let file_url = format!("/uploads/{}", stored_name);
    info!("stored upload {} for {}", stored_name, conn.username);
    conn.set_dynamic(
        200,
        HTML_UTF8,
        pages::upload_success(&original, &file_url, size),
    );
    RequestStatus::Dynamic
}

fn delete_fail(conn: &mut Connection, status: u16, reason: &str) -> RequestStatus {
    conn.set_dynamic(status, HTML_UTF8, pages::delete_failed(reason));
    RequestStatus::Dynamic
}

fn handle_delete(conn: &mut Connection, ctx: &ServerCtx) -> RequestStatus {
    if conn.parser.method != Method::Post {
        return delete_fail(conn, 400, "Deletion requires a POST request.");
    }
    if conn.username.is_empty() {
        return delete_fail(conn, 400, "No signed-in user detected.");
    }
    let Some((start, len)) = conn.body_range() else {
        return delete_fail(conn, 400, "No delete request detected.");
    };
    let body = String::from_utf8_lossy(&conn.read_buf[start..start + len]).into_owned();
    let stored = util::form_value(&body, "file")
        .filter(|value| !value.is_empty())
        .or_else(|| util::form_value(&body, "stored"))
        .unwrap_or_default();
    if stored.is_empty() {
        return delete_fail(conn, 400, "No file named in the delete request.");
    }
    if stored.contains("..") || stored.contains('/') || stored.contains('\\') {
        return delete_fail(conn, 400, "That file name is not valid.");
    }
    if !uploads::owns(&ctx.webroot, &conn.username, &stored) {
        return delete_fail(conn, 404, "You do not own a file by that name.");
    }
    match uploads::remove(&ctx.webroot, &conn.username, &stored) {
        Ok(RemoveOutcome::Removed) => {
            info!("deleted upload {} for {}", stored, conn.username);
            conn.set_dynamic(200, HTML_UTF8, pages::delete_success());
            RequestStatus::Dynamic
        }
        Ok(RemoveOutcome::NotListed) => {
            delete_fail(conn, 404, "No listing entry for that file.")
        }
        Err(err) => {
            error!("delete {} failed: {}", stored, err);
            delete_fail(conn, 500, "Could not update the upload records.")
        }
    }
}

/// Serve `<root>/404.html` as the not-found body when it exists; fall back
/// to the canned plain-text 404 otherwise.
fn render_not_found(conn: &mut Connection, ctx: &ServerCtx) -> RequestStatus {
    match fs::read_to_string(ctx.webroot.join("404.html")) {
        Ok(page) => {
            conn.set_dynamic(404, HTML_UTF8, page);
            RequestStatus::Dynamic
        }
        Err(_) => RequestStatus::NotFound,
    }
}

/// Run the interpreter and capture its output. Interpreter trouble yields a
/// canned explanation page rather than an error status.
fn handle_php(conn: &mut Connection, ctx: &ServerCtx, url: &str) -> RequestStatus {
    let path = ctx.webroot.join(&url[1..]);
    if fs::metadata(&path).is_err() {
        return render_not_found(conn, ctx);
    }
    let output = match Command::new("php").arg(&path).output() {
        Ok(output) => {
            let mut bytes = output.stdout;
            bytes.extend_from_slice(&output.stderr);
            if bytes.is_empty() {
                pages::php_empty_output().into_bytes()
            } else {
                bytes
            }
        }
        Err(err) => {
            error!("php spawn failed for {}: {}", path.display(), err);
            pages::php_unavailable().into_bytes()
        }
    };
    conn.response_status = 200;
    conn.dynamic_content_type = Some(HTML_UTF8.to_string());
    conn.body = Body::Owned(output);
    RequestStatus::Subprocess
}

fn serve_static(conn: &mut Connection, ctx: &ServerCtx, url: &str) -> RequestStatus {
    let path = ctx.webroot.join(&url[1..]);
    let metadata = match fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(_) => return render_not_found(conn, ctx),
    };
    if metadata.permissions().mode() & 0o004 == 0 {
        return RequestStatus::Forbidden;
    }
    if metadata.is_dir() {
        return RequestStatus::BadRequest;
    }

    conn.content_type = mime_for_path(url).to_string();
    if metadata.len() == 0 {
        conn.body = Body::None;
        return RequestStatus::File;
    }
    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(err) => {
            error!("open {} failed: {}", path.display(), err);
            return render_not_found(conn, ctx);
        }
    };
    match unsafe { Mmap::map(&file) } {
        Ok(map) => {
            conn.body = Body::Mmapped(map);
            conn.response_status = 200;
            RequestStatus::File
        }
        Err(err) => {
            error!("mmap {} failed: {}", path.display(), err);
            RequestStatus::InternalError
        }
    }
}
