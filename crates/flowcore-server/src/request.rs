//! Per-request helpers: client IP resolution, cookie parsing, and
//! request-ID generation (§6 "HTTP surface").

use std::collections::BTreeMap;

use axum::http::HeaderMap;

/// Resolves the caller's IP: trusts `X-Forwarded-For`/`X-Real-IP` only
/// when the server is configured to sit behind a proxy, otherwise falls
/// back to the TCP peer address.
pub fn client_ip(headers: &HeaderMap, peer: std::net::SocketAddr, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if !real_ip.is_empty() {
                return real_ip.to_string();
            }
        }
    }
    peer.ip().to_string()
}

/// Parses the `Cookie` header into a name->value map; malformed pairs
/// are skipped rather than rejecting the whole header.
pub fn parse_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    let Some(raw) = headers.get("cookie").and_then(|v| v.to_str().ok()) else {
        return cookies;
    };
    for pair in raw.split(';') {
        let mut parts = pair.splitn(2, '=');
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        cookies.insert(name.trim().to_string(), value.trim().to_string());
    }
    cookies
}

/// Flattens an axum `HeaderMap` into the plain string map the executor's
/// environment expects, lower-casing names for case-insensitive lookup.
pub fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_lowercase(), value.to_str().unwrap_or_default().to_string()))
        .collect()
}

/// A fresh request ID: a UUID v4, matching the teacher's ID-generation
/// convention for per-request correlation (`uuid` is already a shared
/// workspace dependency for the same reason).
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
