//! Error types for the relay and its HTTP control API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Failures raised by the PTY wrapper, the session registry and the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The shell process could not be created.
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// Token absent, already consumed, expired or never issued.
    #[error("invalid or expired handshake token")]
    InvalidToken,

    /// No live session is registered under this process id.
    #[error("no live session for pid {0}")]
    UnknownSession(u32),

    #[error("failed to resize pid {pid}: {reason}")]
    Resize { pid: u32, reason: String },

    /// Input arrived after the process stopped reading it.
    #[error("write to pid {0} after process exit")]
    WriteAfterExit(u32),

    #[error("pid {0} is already registered")]
    DuplicateSession(u32),

    #[error("invalid identity `{0}`")]
    InvalidIdentity(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Spawn { .. } => "spawn_failed",
            RelayError::InvalidToken => "invalid_token",
            RelayError::UnknownSession(_) => "unknown_session",
            RelayError::Resize { .. } => "resize_failed",
            RelayError::WriteAfterExit(_) => "write_after_exit",
            RelayError::DuplicateSession(_) => "duplicate_session",
            RelayError::InvalidIdentity(_) => "invalid_identity",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidToken => StatusCode::UNAUTHORIZED,
            RelayError::UnknownSession(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            RelayError::DuplicateSession(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// An error returned from a control API handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                code: code.map(str::to_string),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError::new(err.status(), err.to_string(), Some(err.code()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
