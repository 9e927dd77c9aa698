//! Which headers cross the gateway in each direction.
//!
//! Incoming request headers are copied upstream minus hop-by-hop headers and
//! anything the gateway itself owns (the caller's credential, the challenge
//! token, host and length). Upstream response headers are copied back minus
//! hop-by-hop headers and the length, since bodies are re-streamed.

use axum::http::{HeaderMap, HeaderName, HeaderValue};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers the gateway consumes and never forwards.
const GATEWAY_OWNED: &[&str] = &["host", "content-length", "authorization", "x-vtoken"];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Headers from the client that should reach the provider.
pub fn forwardable_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let key = name.as_str();
        if is_hop_by_hop(key) || GATEWAY_OWNED.contains(&key) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers from the provider's response that should reach the client.
///
/// Takes the upstream client's header map, whose types come from a
/// different `http` major version, and converts entry by entry.
pub fn forwardable_response_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let key = name.as_str();
        if is_hop_by_hop(key) || key == "content-length" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

/// Convert a gateway header map into the upstream client's header type.
pub fn to_upstream_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}
