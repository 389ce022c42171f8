// src/pages.rs
//
// Server-rendered HTML bodies for the dynamic routes. Every page goes
// through the same shell so the navigation and styling match the static
// site under the webroot.

use crate::uploads::UploadRecord;
use crate::util::{self, html_escape};

pub fn page_shell(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<link rel="icon" href="/assets/media/favicon.ico">
<link rel="stylesheet" href="/assets/css/site.css">
<title>ravel | {title}</title>
</head>
<body>
<div class="page">
<div class="nav">
<div class="brand">ravel</div>
<div class="nav-links">
<a href="/">Home</a>
<a href="/uploads/list">My uploads</a>
<a href="/pages/status.html">Status</a>
</div>
<div class="nav-auth">
<a class="btn ghost" href="/pages/log.html">Sign in</a>
<a class="btn primary" href="/pages/register.html">Register</a>
</div>
</div>{body}</div>
<script src="/assets/js/nav-auth.js"></script>
</body>
</html>"#
    )
}

fn panel(heading: &str, message: &str, actions: &str) -> String {
    format!(
        r#"<section class="panel" style="max-width: 620px; margin: 0 auto;">
<h2 style="font-size: 24px;">{heading}</h2>
<p style="margin-top: 8px; color: var(--muted);">{message}</p>
<div class="actions" style="margin-top: 16px;">
{actions}
</div>
</section>"#
    )
}

pub fn welcome(username: &str) -> String {
    let body = format!(
        r#"<section class="hero">
<div>
<h1>Welcome back, {}</h1>
<p>This is your personal space: uploads, media galleries and live server status.</p>
<div class="actions">
<a class="btn primary" href="/uploads/list">My uploads</a>
<a class="btn ghost" href="/pages/upload.html">Upload a file</a>
</div>
</div>
<div class="panel">
<h3>What this server does</h3>
<p style="margin-top: 12px; color: var(--muted);">Static assets, per-user uploads, inline media, JSON status and PHP pages.</p>
</div>
</section>"#,
        html_escape(username)
    );
    page_shell("Welcome", &body)
}

pub fn login_required() -> String {
    page_shell(
        "Sign in required",
        &panel(
            "Please sign in first",
            "This page is only available to signed-in users.",
            r#"<a class="btn primary" href="/pages/log.html">Go to sign in</a>
<a class="btn ghost" href="/pages/register.html">Create an account</a>"#,
        ),
    )
}

pub fn logged_out() -> String {
    page_shell(
        "Signed out",
        &panel(
            "You are signed out",
            "Your session has ended; sign in again whenever you like.",
            r#"<a class="btn primary" href="/pages/log.html">Go to sign in</a>"#,
        ),
    )
}

pub fn payload_too_large() -> String {
    page_shell(
        "Payload too large",
        &panel(
            "Upload failed",
            "The request body exceeds the server limit; shrink the file and retry.",
            r#"<a class="btn primary" href="/pages/upload.html">Back to upload</a>"#,
        ),
    )
}

pub fn upload_failed(reason: &str) -> String {
    page_shell(
        "Upload failed",
        &panel(
            "Upload failed",
            reason,
            r#"<a class="btn primary" href="/pages/upload.html">Back to upload</a>"#,
        ),
    )
}

pub fn upload_success(original_name: &str, file_url: &str, size: usize) -> String {
    let body = format!(
        r#"<section class="panel" style="max-width: 820px; margin: 0 auto;">
<h2 style="font-size: 26px;">Upload complete</h2>
<p style="margin-top: 8px; color: var(--muted);">The file is stored and visible only to you.</p>
<div class="grid" style="margin-top: 18px;">
<div class="card"><h3>File name</h3><p>{}</p></div>
<div class="card"><h3>Location</h3><p><a href="{url}">{url}</a></p></div>
<div class="card"><h3>Size (bytes)</h3><p>{}</p></div>
</div>
<div class="actions" style="margin-top: 20px;">
<a class="btn primary" href="{url}">View it now</a>
<a class="btn ghost" href="/pages/upload.html">Upload another</a>
</div>
</section>"#,
        html_escape(original_name),
        size,
        url = file_url,
    );
    page_shell("Upload complete", &body)
}

pub fn delete_failed(reason: &str) -> String {
    page_shell(
        "Delete failed",
        &panel(
            "Delete failed",
            reason,
            r#"<a class="btn primary" href="/uploads/list">Back to my uploads</a>
<a class="btn ghost" href="/pages/upload.html">Upload a file</a>"#,
        ),
    )
}

pub fn delete_success() -> String {
    page_shell(
        "Deleted",
        &panel(
            "Delete complete",
            "The file and its listing entry are gone.",
            r#"<a class="btn primary" href="/uploads/list">Back to my uploads</a>
<a class="btn ghost" href="/pages/upload.html">Upload a file</a>"#,
        ),
    )
}

/// Gallery of the user's uploads; images and videos render inline by
/// extension, everything else gets a plain link.
pub fn upload_listing(items: &[UploadRecord]) -> String {
    let mut body = String::from(
        r#"<section class="panel" style="max-width: 980px; margin: 0 auto;">
<h2 style="font-size: 26px;">My uploads</h2>
<p style="margin-top: 8px; color: var(--muted);">Everything below is visible to your account only.</p>"#,
    );

    if items.is_empty() {
        body.push_str(r#"<p style="margin-top: 16px;">Nothing here yet; upload something first.</p>"#);
    } else {
        body.push_str(r#"<div class="grid" style="margin-top: 18px;">"#);
        for item in items {
            let url = format!("/uploads/{}", item.stored_name);
            let ext = util::file_extension(&item.stored_name);
            body.push_str(r#"<div class="card">"#);
            if util::is_image_ext(&ext) {
                body.push_str(&format!(
                    r#"<img src="{}" alt="{}" style="width:100%; border-radius: 18px; margin-bottom: 12px;">"#,
                    url,
                    html_escape(&item.original_name)
                ));
            } else if util::is_video_ext(&ext) {
                body.push_str(&format!(
                    r#"<video src="{}" controls preload="metadata" style="width:100%; border-radius: 18px; margin-bottom: 12px;"></video>"#,
                    url
                ));
            }
            body.push_str(&format!(
                r#"<h3>{}</h3><p style="margin-top: 8px;">Uploaded: {}</p><p>Size: {} bytes</p>
<a href="{}" class="btn ghost" style="margin-top: 12px; display: inline-flex;">View</a>
<form action="/uploads/delete" method="post" style="margin-top: 10px;">
<input type="hidden" name="file" value="{}">
<button class="btn ghost" type="submit">Delete</button>
</form></div>"#,
                html_escape(&item.original_name),
                util::format_time(item.timestamp),
                item.size,
                url,
                html_escape(&item.stored_name),
            ));
        }
        body.push_str("</div>");
    }

    body.push_str(
        r#"<div class="actions" style="margin-top: 20px;">
<a class="btn primary" href="/pages/upload.html">Upload more</a>
</div>
</section>"#,
    );
    page_shell("My uploads", &body)
}

pub fn php_unavailable() -> String {
    concat!(
        "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"UTF-8\">",
        "<title>PHP Error</title></head>",
        "<body><h2>PHP interpreter unavailable</h2>",
        "<p>Could not invoke the PHP interpreter; install it and make sure it is on PATH.</p>",
        "</body></html>"
    )
    .to_string()
}

pub fn php_empty_output() -> String {
    concat!(
        "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"UTF-8\">",
        "<title>PHP Error</title></head>",
        "<body><h2>PHP produced no output</h2>",
        "<p>The script ran but printed nothing; check the PHP installation.</p>",
        "</body></html>"
    )
    .to_string()
}
