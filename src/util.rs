// src/util.rs
//
// Small text and address helpers shared by the parser, the route handlers
// and the page builders.

use std::net::Ipv4Addr;

use chrono::{Local, TimeZone};

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(10 + ch - b'a'),
        b'A'..=b'F' => Some(10 + ch - b'A'),
        _ => None,
    }
}

/// Percent-decoding with `+` treated as space. Invalid escapes pass through
/// untouched, which makes decoding idempotent on already-decoded input.
pub fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
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

/// Extract and decode one `key=value` field from a form body.
pub fn form_value(body: &str, key: &str) -> Option<String> {
    let pattern = format!("{}=", key);
    let start = body.find(&pattern)? + pattern.len();
    let rest = &body[start..];
    let raw = match rest.find('&') {
        Some(end) => &rest[..end],
        None => rest,
    };
    Some(url_decode(raw))
}

/// Pull one cookie value out of a `Cookie:` header line.
pub fn cookie_value(header: &str, key: &str) -> Option<String> {
    for pair in header.split(';') {
        let pair = pair.trim();
        if let Some(eq) = pair.find('=') {
            if pair[..eq].trim() == key {
                return Some(pair[eq + 1..].to_string());
            }
        }
    }
    None
}

pub fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Replace path separators and control characters, strip leading dots, and
/// never return an empty name.
pub fn sanitize_filename(value: &str) -> String {
    let mut name = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '/' | '\\' | ':' | '|' | '<' | '>' | '"') || ch.is_control() {
            name.push('_');
        } else {
            name.push(ch);
        }
    }
    let name = name.trim_start_matches('.').to_string();
    if name.is_empty() {
        "upload.bin".to_string()
    } else {
        name
    }
}

/// First IP of a comma-separated forwarding chain.
pub fn extract_forwarded_ip(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.find(',') {
        Some(comma) => trimmed[..comma].trim().to_string(),
        None => trimmed.to_string(),
    }
}

fn is_private_ipv4(ip: &str) -> bool {
    if ip.starts_with("10.") || ip.starts_with("127.") || ip.starts_with("192.168.") {
        return true;
    }
    if let Some(rest) = ip.strip_prefix("172.") {
        if let Some(dot) = rest.find('.') {
            if let Ok(second) = rest[..dot].parse::<u8>() {
                return (16..=31).contains(&second);
            }
        }
    }
    false
}

/// Private, loopback and link-local peers collapse to the literal `local` so
/// multi-tab testing from one LAN host counts as a single visitor.
pub fn normalize_client_ip(ip: &str) -> String {
    if ip.is_empty() {
        return String::new();
    }
    if ip == "::1" || is_private_ipv4(ip) || ip.starts_with("fe80:") {
        return "local".to_string();
    }
    ip.to_string()
}

pub fn normalize_peer(addr: Ipv4Addr) -> String {
    normalize_client_ip(&addr.to_string())
}

/// `YYYY-MM-DD HH:MM` for the listing pages; `-` for unusable stamps.
pub fn format_time(timestamp: i64) -> String {
    if timestamp <= 0 {
        return "-".to_string();
    }
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        None => "-".to_string(),
    }
}

pub fn is_image_ext(ext: &str) -> bool {
    matches!(ext, ".png" | ".jpg" | ".jpeg" | ".gif" | ".webp" | ".svg")
}

pub fn is_video_ext(ext: &str) -> bool {
    matches!(ext, ".mp4" | ".webm" | ".ogg")
}

/// Lowercased extension (with dot) of a file name, or empty.
pub fn file_extension(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) => name[idx..].to_ascii_lowercase(),
        None => String::new(),
    }
}
