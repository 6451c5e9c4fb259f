//! Connection relay.
//!
//! Pairs one websocket with one PTY process and copies bytes both ways until
//! either side goes away. In token mode the first frame must be a token
//! issued by `/api/connect`; in simple mode the shell starts on accept.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{dimension_or_default, RelayConfig, DEFAULT_COLS, DEFAULT_ROWS};
use crate::pty::{ExitSignal, PtyHandle, PtyOutput, PtyProcess, SpawnOptions};
use crate::origin::{origin_allowed, origin_rejected};
use crate::registry::{PtySession, SessionRegistry};
use crate::state::AppState;

/// Environment variable carrying the session owner into the shell.
pub const OWNER_ENV: &str = "XTERM_RELAY_USER";

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    ClientClosed,
    ClientError,
    SendFailed,
    ProcessExited,
    Shutdown,
}

#[derive(Debug, Default)]
struct Traffic {
    bytes_in: usize,
    bytes_out: usize,
}

/// `GET /ws`: token-authenticated relay.
pub async fn token_relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !origin_allowed(&headers, &state.config.allowed_origins) {
        warn!(origin = ?headers.get("origin"), "Rejected relay upgrade from foreign origin");
        return origin_rejected().into_response();
    }
    let cols = dimension_or_default(parse_dimension(params.get("cols")), DEFAULT_COLS);
    let rows = dimension_or_default(parse_dimension(params.get("rows")), DEFAULT_ROWS);
    ws.on_upgrade(move |socket| handle_token_socket(socket, state, cols, rows))
        .into_response()
}

/// Simple mode: any path on the relay port spawns a shell right away.
pub async fn simple_relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&headers, &state.config.allowed_origins) {
        warn!(origin = ?headers.get("origin"), "Rejected relay upgrade from foreign origin");
        return origin_rejected().into_response();
    }
    ws.on_upgrade(move |socket| handle_simple_socket(socket, state))
        .into_response()
}

fn parse_dimension(value: Option<&String>) -> Option<u16> {
    value.and_then(|v| v.trim().parse().ok())
}

async fn handle_token_socket(socket: WebSocket, state: AppState, cols: u16, rows: u16) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    debug!("Relay connection accepted, waiting for token");

    let token = match tokio::time::timeout(state.config.handshake_timeout, read_token(&mut ws_rx)).await
    {
        Ok(Some(token)) => token,
        Ok(None) => {
            debug!("Connection ended before a token was presented");
            return;
        }
        Err(_) => {
            warn!("Handshake timed out");
            close_with(&mut ws_tx, close_code::POLICY, "handshake timeout").await;
            return;
        }
    };

    let identity = match state.registry.consume_token(&token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "Rejected relay handshake");
            let _ = ws_tx.close().await;
            return;
        }
    };

    let opts = spawn_options(&state.config, Some(&identity), cols, rows);
    run_session(ws_tx, ws_rx, &state, opts, Some(identity)).await;
}

async fn handle_simple_socket(socket: WebSocket, state: AppState) {
    let (ws_tx, ws_rx) = socket.split();
    let opts = spawn_options(&state.config, None, DEFAULT_COLS, DEFAULT_ROWS);
    run_session(ws_tx, ws_rx, &state, opts, None).await;
}

/// Wait for the first data frame and read it as a token.
async fn read_token(ws_rx: &mut WsReceiver) -> Option<String> {
    loop {
        match ws_rx.next().await? {
            Ok(Message::Text(text)) => return Some(text.trim().to_string()),
            Ok(Message::Binary(data)) => {
                return String::from_utf8(data).ok().map(|t| t.trim().to_string())
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
}

/// Build the command line for a new session.
pub fn spawn_options(
    config: &RelayConfig,
    identity: Option<&str>,
    cols: u16,
    rows: u16,
) -> SpawnOptions {
    let opts = match identity {
        Some(user) if config.login_shell => SpawnOptions::new("su").args(["-", user]),
        _ => SpawnOptions::new(config.shell.clone()).args(config.shell_args.clone()),
    };
    let opts = opts
        .size(cols, rows)
        .cwd(config.cwd.clone())
        .env("TERM", config.term.clone());
    match identity {
        Some(user) => opts.env(OWNER_ENV, user),
        None => opts,
    }
}

async fn run_session(
    mut ws_tx: WsSender,
    mut ws_rx: WsReceiver,
    state: &AppState,
    opts: SpawnOptions,
    owner: Option<String>,
) {
    if state.registry.is_shutting_down() {
        close_with(&mut ws_tx, close_code::AWAY, "server shutting down").await;
        return;
    }

    let PtyProcess {
        handle,
        output,
        exit,
    } = match PtyProcess::spawn(&opts) {
        Ok(process) => process,
        Err(e) => {
            error!(error = %e, owner = ?owner, "Failed to start shell");
            let line = format!("\r\n...FAILED TO START SHELL: {e}...\r\n");
            let _ = ws_tx.send(Message::Text(line)).await;
            close_with(&mut ws_tx, close_code::ERROR, "spawn failed").await;
            return;
        }
    };
    let pid = handle.pid();

    let session = Arc::new(PtySession::new(handle.control(), owner.clone()));
    if let Err(e) = state.registry.register(Arc::clone(&session)) {
        error!(pid, error = %e, "Failed to register session");
        handle.kill();
        close_with(&mut ws_tx, close_code::ERROR, "registration failed").await;
        return;
    }
    info!(pid, owner = ?owner, "Session started");

    let cancel = state.registry.shutdown_signal();
    let (reason, traffic) = match ws_tx.send(Message::Text(pid.to_string())).await {
        Ok(()) => {
            pump(
                &mut ws_tx,
                &mut ws_rx,
                &handle,
                &state.registry,
                &session,
                output,
                exit,
                &cancel,
                state.config.exit_drain_grace,
            )
            .await
        }
        Err(e) => {
            debug!(pid, error = %e, "Client went away before pid announcement");
            (EndReason::SendFailed, Traffic::default())
        }
    };

    handle.kill();
    state.registry.unregister_session(&session);

    match reason {
        EndReason::ProcessExited => {
            close_with(&mut ws_tx, close_code::NORMAL, "process exited").await
        }
        EndReason::Shutdown => {
            close_with(&mut ws_tx, close_code::AWAY, "server shutting down").await
        }
        EndReason::ClientClosed | EndReason::ClientError | EndReason::SendFailed => {}
    }

    info!(
        pid,
        reason = ?reason,
        bytes_in = traffic.bytes_in,
        bytes_out = traffic.bytes_out,
        "Session closed"
    );
}

/// Copy bytes between the socket and the process until one side ends.
#[allow(clippy::too_many_arguments)]
async fn pump(
    ws_tx: &mut WsSender,
    ws_rx: &mut WsReceiver,
    handle: &PtyHandle,
    registry: &SessionRegistry,
    session: &Arc<PtySession>,
    mut output: PtyOutput,
    mut exit: ExitSignal,
    cancel: &CancellationToken,
    drain_grace: Duration,
) -> (EndReason, Traffic) {
    let pid = handle.pid();
    let mut traffic = Traffic::default();

    let reason = loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(data) => {
                    traffic.bytes_out += data.len();
                    if let Err(e) = ws_tx.send(Message::Binary(data)).await {
                        debug!(pid, error = %e, "Failed to send output");
                        break EndReason::SendFailed;
                    }
                }
                None => break EndReason::ProcessExited,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => forward_input(handle, text.into_bytes(), &mut traffic),
                Some(Ok(Message::Binary(data))) => forward_input(handle, data, &mut traffic),
                Some(Ok(Message::Close(_))) | None => break EndReason::ClientClosed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(pid, error = %e, "WebSocket error");
                    break EndReason::ClientError;
                }
            },
            code = exit.wait(), if !exit.is_terminated() => {
                debug!(pid, exit_code = ?code, "Process exited, draining output");
                // The pid is free for reuse from here on.
                registry.unregister_session(session);
                break match drain_output(ws_tx, &mut output, drain_grace, &mut traffic).await {
                    Ok(()) => EndReason::ProcessExited,
                    Err(reason) => reason,
                };
            }
            _ = cancel.cancelled() => break EndReason::Shutdown,
        }
    };

    (reason, traffic)
}

fn forward_input(handle: &PtyHandle, data: Vec<u8>, traffic: &mut Traffic) {
    traffic.bytes_in += data.len();
    if let Err(e) = handle.write(data) {
        debug!(pid = handle.pid(), error = %e, "Dropped input");
    }
}

/// Forward output still in flight after exit, until EOF or a quiet period.
async fn drain_output(
    ws_tx: &mut WsSender,
    output: &mut PtyOutput,
    grace: Duration,
    traffic: &mut Traffic,
) -> Result<(), EndReason> {
    while let Ok(Some(data)) = tokio::time::timeout(grace, output.recv()).await {
        traffic.bytes_out += data.len();
        if ws_tx.send(Message::Binary(data)).await.is_err() {
            return Err(EndReason::SendFailed);
        }
    }
    Ok(())
}

async fn close_with(ws_tx: &mut WsSender, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}
