//! Relay between browser terminal widgets and server-side PTY shells.

pub mod config;
pub mod control;
pub mod error;
pub mod identity;
pub mod origin;
pub mod pty;
pub mod registry;
pub mod relay;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use config::{RelayConfig, RelayMode};
pub use error::{RelayError, RelayResult};
pub use state::AppState;

/// Path of the token-mode relay websocket on the control endpoint.
pub const RELAY_PATH: &str = "/ws";

/// Control API router. In token mode it also serves the relay websocket.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(control::health))
        .route("/api/connect", post(control::connect))
        .route("/api/resize", post(control::resize));

    if state.config.mode == RelayMode::Token {
        router = router.route(RELAY_PATH, get(relay::token_relay_handler));
    }

    if let Some(dir) = state.config.static_dir.clone() {
        router = router.fallback_service(ServeDir::new(dir));
    }

    let cors = origin::cors_layer(&state.config.allowed_origins);
    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Simple-mode relay router: every path upgrades and spawns a shell.
pub fn build_simple_router(state: AppState) -> Router {
    Router::new()
        .fallback(relay::simple_relay_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
