//! Control API.
//!
//! `/api/connect` hands out the relay endpoint (and a token in token mode);
//! `/api/resize` forwards terminal size changes to a live session.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{dimension_or_default, simple_relay_port, RelayMode, DEFAULT_COLS, DEFAULT_ROWS};
use crate::error::ApiError;
use crate::identity::validate_identity;
use crate::origin::{origin_allowed, origin_rejected};
use crate::state::AppState;
use crate::RELAY_PATH;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Username the client expects. Must agree with the identity provider;
    /// used alone only when the server trusts client-supplied identities.
    #[serde(default)]
    pub identity: Option<String>,
    /// Host the browser used to reach this server.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Whether the page was loaded over TLS (`wss://` instead of `ws://`).
    #[serde(default)]
    pub secure: bool,
    /// Public port of the control endpoint, if it differs from the bound one.
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub pid: u32,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /api/connect`
pub async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    if !origin_allowed(&headers, &state.config.allowed_origins) {
        return Err(origin_rejected());
    }

    let hostname = request
        .hostname
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .unwrap_or("localhost");
    if !is_valid_hostname(hostname) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("invalid hostname `{hostname}`"),
            Some("invalid_hostname"),
        ));
    }
    let port = request.port.unwrap_or(state.control_port);

    match state.config.mode {
        RelayMode::Simple => Ok(Json(ConnectResponse {
            uri: relay_uri(request.secure, hostname, simple_relay_port(port), "/"),
            token: None,
        })),
        RelayMode::Token => {
            let identity = resolve_identity(&state, &headers, request.identity.as_deref())?;
            let token = state.registry.issue_token(&identity);
            Ok(Json(ConnectResponse {
                uri: relay_uri(request.secure, hostname, port, RELAY_PATH),
                token: Some(token),
            }))
        }
    }
}

/// The identity provider is authoritative. A client-supplied identity must
/// agree with it, and is taken on its own only when clients are trusted.
fn resolve_identity(
    state: &AppState,
    headers: &HeaderMap,
    claimed: Option<&str>,
) -> Result<String, ApiError> {
    let claimed = claimed.map(str::trim).filter(|id| !id.is_empty());

    let identity = match (state.identity.resolve(headers), claimed) {
        (Some(resolved), Some(claimed)) if resolved != claimed => {
            warn!(resolved = %resolved, claimed, "Rejected connect for another identity");
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "identity does not match the authenticated caller",
                Some("identity_mismatch"),
            ));
        }
        (Some(resolved), _) => resolved,
        (None, Some(claimed)) if state.config.trust_client_identity => claimed.to_string(),
        _ => {
            return Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "no identity for caller",
                Some("identity_required"),
            ))
        }
    };

    validate_identity(&identity)?;
    Ok(identity)
}

/// `POST /api/resize`. Unknown or exited sessions answer `false`.
pub async fn resize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ResizeRequest>,
) -> Result<Json<bool>, ApiError> {
    if !origin_allowed(&headers, &state.config.allowed_origins) {
        return Err(origin_rejected());
    }

    let cols = dimension_or_default(request.cols, DEFAULT_COLS);
    let rows = dimension_or_default(request.rows, DEFAULT_ROWS);

    match state.registry.resize(request.pid, cols, rows) {
        Ok(()) => Ok(Json(true)),
        Err(e) => {
            debug!(pid = request.pid, error = %e, "Resize ignored");
            Ok(Json(false))
        }
    }
}

pub fn relay_uri(secure: bool, hostname: &str, port: u16, path: &str) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    format!("{}://{}:{}{}", scheme, hostname, port, path)
}

fn is_valid_hostname(hostname: &str) -> bool {
    hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
}
