//! Browser origin checks for the control API and relay upgrades.
//!
//! Requests without an `Origin` header come from non-browser clients and
//! pass. Browser requests must be same-origin or from a configured origin.

use axum::http::header::{CONTENT_TYPE, HOST, ORIGIN};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::error::ApiError;

/// Whether the request's `Origin` (if any) may use this server.
pub fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = headers.get(ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
        return true;
    }
    headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|host| is_same_origin(origin, host))
}

pub fn origin_rejected() -> ApiError {
    ApiError::new(
        StatusCode::FORBIDDEN,
        "origin not allowed",
        Some("origin_not_allowed"),
    )
}

/// Compare the host part of an origin URL with a `Host` header. Loopback
/// names are interchangeable; ports must match.
pub fn is_same_origin(origin: &str, host: &str) -> bool {
    let origin_host = origin
        .split("://")
        .nth(1)
        .unwrap_or(origin)
        .split('/')
        .next()
        .unwrap_or("");

    fn strip_port(h: &str) -> &str {
        if h.starts_with('[') {
            h.rsplit_once("]:")
                .map_or(h, |(addr, _)| addr)
                .trim_start_matches('[')
                .trim_end_matches(']')
        } else {
            h.rsplit_once(':').map_or(h, |(addr, _)| addr)
        }
    }
    fn port(h: &str) -> Option<&str> {
        if h.starts_with('[') {
            h.rsplit_once("]:").map(|(_, p)| p)
        } else {
            h.rsplit_once(':').map(|(_, p)| p)
        }
    }

    let is_loopback = |h: &str| matches!(h, "localhost" | "127.0.0.1" | "::1");
    let oh = strip_port(origin_host);
    let hh = strip_port(host);

    (oh.eq_ignore_ascii_case(hh) || (is_loopback(oh) && is_loopback(hh)))
        && port(origin_host) == port(host)
}

/// CORS for the control API. With no configured origins no cross-origin
/// response headers are sent, so browsers refuse to read the responses.
pub fn cors_layer(allowed: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %o, "Ignoring unparsable allowed origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
}
