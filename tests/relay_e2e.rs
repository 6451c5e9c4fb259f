//! End-to-end relay tests against a real listener and real shells.
#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderName;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use xterm_relay::control::ConnectResponse;
use xterm_relay::identity::{IdentityProvider, ProcessOwner, TrustedHeader};
use xterm_relay::{build_router, build_simple_router, AppState, RelayConfig, RelayMode};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

struct TestServer {
    addr: SocketAddr,
    state: AppState,
}

impl TestServer {
    async fn start(config: RelayConfig) -> Self {
        Self::start_with_identity(config, Arc::new(ProcessOwner)).await
    }

    async fn start_with_identity(config: RelayConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(config, identity, addr.port());
        let app = match state.config.mode {
            RelayMode::Token => build_router(state.clone()),
            RelayMode::Simple => build_simple_router(state.clone()),
        };
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    async fn connect(&self, path: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}{}", self.addr, path))
            .await
            .unwrap();
        ws
    }

    /// Present a fresh token and return the socket plus the announced pid.
    async fn handshake(&self, identity: &str) -> (Client, u32) {
        let token = self.state.registry.issue_token(identity);
        let mut ws = self.connect("/ws").await;
        ws.send(Message::Text(token)).await.unwrap();
        let pid = expect_pid(&mut ws).await;
        (ws, pid)
    }
}

fn shell_config(shell: &str) -> RelayConfig {
    RelayConfig {
        shell: shell.to_string(),
        cwd: Some(std::env::temp_dir()),
        ..RelayConfig::default()
    }
}

async fn expect_pid(ws: &mut Client) -> u32 {
    match timeout(WAIT, ws.next()).await.expect("no pid frame") {
        Some(Ok(Message::Text(text))) => text.parse().expect("pid frame is numeric"),
        other => panic!("expected pid frame, got {other:?}"),
    }
}

/// Collect output frames until `needle` shows up or the socket ends.
async fn read_until(ws: &mut Client, needle: &str) -> String {
    let deadline = Instant::now() + WAIT;
    let mut buf = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => buf.extend(data),
            Ok(Some(Ok(Message::Text(text)))) => buf.extend(text.into_bytes()),
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
        if String::from_utf8_lossy(&buf).contains(needle) {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Skip output until the server closes; return the close frame, if any.
async fn read_until_close(ws: &mut Client) -> Option<CloseFrame<'static>> {
    loop {
        match timeout(WAIT, ws.next()).await.expect("server did not close") {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            None | Some(Err(_)) => return None,
        }
    }
}

async fn assert_closed_without_data(ws: &mut Client) {
    loop {
        match timeout(WAIT, ws.next()).await.expect("server did not close") {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("unexpected frame before close: {other:?}"),
        }
    }
}

async fn wait_for_sessions(state: &AppState, expected: usize) {
    let deadline = Instant::now() + WAIT;
    while state.registry.session_count() != expected {
        assert!(
            Instant::now() < deadline,
            "expected {expected} sessions, have {}",
            state.registry.session_count()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn handshake_spawns_shell_and_relays_io() {
    let server = TestServer::start(shell_config("/bin/sh")).await;
    let (mut ws, pid) = server.handshake("alice").await;

    assert!(pid > 0);
    let session = server.state.registry.lookup(pid).unwrap();
    assert_eq!(session.owner.as_deref(), Some("alice"));

    ws.send(Message::Text("echo relay-$((40+2))\n".into()))
        .await
        .unwrap();
    let out = read_until(&mut ws, "relay-42").await;
    assert!(out.contains("relay-42"), "output was {out:?}");

    ws.send(Message::Binary(b"echo owner:$XTERM_RELAY_USER\n".to_vec()))
        .await
        .unwrap();
    let out = read_until(&mut ws, "owner:alice").await;
    assert!(out.contains("owner:alice"), "output was {out:?}");
}

#[tokio::test]
async fn input_frames_reach_process_in_order() {
    let server = TestServer::start(shell_config("/bin/cat")).await;
    let (mut ws, _pid) = server.handshake("alice").await;

    let words: Vec<String> = (0..50).map(|i| format!("w{i}")).collect();
    for word in &words {
        ws.send(Message::Text(format!("{word} "))).await.unwrap();
    }
    ws.send(Message::Text("\n".into())).await.unwrap();

    let expected = words.join(" ");
    let out = read_until(&mut ws, &expected).await;
    assert!(out.contains(&expected), "output was {out:?}");
}

#[tokio::test]
async fn resize_reaches_live_session() {
    let server = TestServer::start(shell_config("/bin/sh")).await;
    let (mut ws, pid) = server.handshake("alice").await;

    server.state.registry.resize(pid, 120, 40).unwrap();
    let session = server.state.registry.lookup(pid).unwrap();
    assert_eq!(session.size().unwrap(), (120, 40));

    ws.send(Message::Text("stty size\n".into())).await.unwrap();
    let out = read_until(&mut ws, "40 120").await;
    assert!(out.contains("40 120"), "output was {out:?}");
}

#[tokio::test]
async fn initial_size_comes_from_query() {
    let server = TestServer::start(shell_config("/bin/sh")).await;
    let token = server.state.registry.issue_token("alice");
    let mut ws = server.connect("/ws?cols=100&rows=30").await;
    ws.send(Message::Text(token)).await.unwrap();
    let pid = expect_pid(&mut ws).await;

    let session = server.state.registry.lookup(pid).unwrap();
    assert_eq!(session.size().unwrap(), (100, 30));
}

#[tokio::test]
async fn reused_token_is_rejected_without_spawning() {
    let server = TestServer::start(shell_config("/bin/sh")).await;
    let token = server.state.registry.issue_token("alice");
    server.state.registry.consume_token(&token).unwrap();

    let mut ws = server.connect("/ws").await;
    ws.send(Message::Text(token)).await.unwrap();
    assert_closed_without_data(&mut ws).await;
    assert_eq!(server.state.registry.session_count(), 0);
}

#[tokio::test]
async fn unknown_token_is_rejected() {
    let server = TestServer::start(shell_config("/bin/sh")).await;
    let mut ws = server.connect("/ws").await;
    ws.send(Message::Text("not-a-token".into())).await.unwrap();
    assert_closed_without_data(&mut ws).await;
    assert_eq!(server.state.registry.session_count(), 0);
}

#[tokio::test]
async fn silent_client_is_closed_after_handshake_timeout() {
    let config = RelayConfig {
        handshake_timeout: Duration::from_millis(200),
        ..shell_config("/bin/sh")
    };
    let server = TestServer::start(config).await;
    let mut ws = server.connect("/ws").await;

    let frame = read_until_close(&mut ws).await.expect("close frame");
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(server.state.registry.session_count(), 0);
}

#[tokio::test]
async fn client_disconnect_kills_and_unregisters_session() {
    let server = TestServer::start(shell_config("/bin/sh")).await;
    let (mut ws, pid) = server.handshake("alice").await;
    assert_eq!(server.state.registry.session_count(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    wait_for_sessions(&server.state, 0).await;
    assert!(server.state.registry.lookup(pid).is_err());
    assert!(server.state.registry.resize(pid, 80, 24).is_err());
}

#[tokio::test]
async fn process_exit_closes_connection() {
    let server = TestServer::start(shell_config("/bin/sh")).await;
    let (mut ws, _pid) = server.handshake("alice").await;

    ws.send(Message::Text("exit\n".into())).await.unwrap();
    let frame = read_until_close(&mut ws).await.expect("close frame");
    assert_eq!(frame.code, CloseCode::Normal);
    assert_eq!(frame.reason, "process exited");
    assert_eq!(server.state.registry.session_count(), 0);
}

#[tokio::test]
async fn output_written_just_before_exit_is_delivered() {
    let server = TestServer::start(shell_config("/bin/sh")).await;
    let (mut ws, _pid) = server.handshake("alice").await;

    ws.send(Message::Text("echo last-$((6*7)); exit\n".into()))
        .await
        .unwrap();
    let out = read_until(&mut ws, "last-42").await;
    assert!(out.contains("last-42"), "output was {out:?}");
    assert!(read_until_close(&mut ws).await.is_some());
}

#[tokio::test]
async fn spawn_failure_is_reported_to_client() {
    let server = TestServer::start(shell_config("/definitely/not/a/shell")).await;
    let token = server.state.registry.issue_token("alice");
    let mut ws = server.connect("/ws").await;
    ws.send(Message::Text(token)).await.unwrap();

    let out = read_until(&mut ws, "FAILED TO START SHELL").await;
    assert!(out.contains("FAILED TO START SHELL"), "output was {out:?}");
    let frame = read_until_close(&mut ws).await.expect("close frame");
    assert_eq!(frame.code, CloseCode::Error);
    assert_eq!(server.state.registry.session_count(), 0);
}

#[tokio::test]
async fn drain_closes_live_sessions() {
    let server = TestServer::start(shell_config("/bin/sh")).await;
    let (mut first, _) = server.handshake("alice").await;
    let (mut second, _) = server.handshake("bob").await;
    assert_eq!(server.state.registry.session_count(), 2);

    let remaining = server.state.registry.drain(WAIT).await;
    assert_eq!(remaining, 0);

    for ws in [&mut first, &mut second] {
        let frame = read_until_close(ws).await.expect("close frame");
        assert_eq!(frame.code, CloseCode::Away);
    }
}

#[tokio::test]
async fn simple_mode_spawns_on_connect() {
    let config = RelayConfig {
        mode: RelayMode::Simple,
        ..shell_config("/bin/sh")
    };
    let server = TestServer::start(config).await;
    let mut ws = server.connect("/").await;

    let pid = expect_pid(&mut ws).await;
    let session = server.state.registry.lookup(pid).unwrap();
    assert_eq!(session.owner, None);

    ws.send(Message::Text("echo simple-$((1+1))\n".into()))
        .await
        .unwrap();
    let out = read_until(&mut ws, "simple-2").await;
    assert!(out.contains("simple-2"), "output was {out:?}");
}

#[tokio::test]
async fn connect_endpoint_leads_to_working_shell() {
    let workdir = std::env::temp_dir().join(format!("xterm-relay-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join("relay-marker.txt"), b"").unwrap();

    let config = RelayConfig {
        cwd: Some(workdir.clone()),
        ..shell_config("/bin/sh")
    };
    let provider = TrustedHeader::new(HeaderName::from_static("x-remote-user"));
    let server = TestServer::start_with_identity(config, Arc::new(provider)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/connect", server.addr))
        .header("x-remote-user", "alice")
        .json(&serde_json::json!({"hostname": "127.0.0.1", "secure": false}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let connect: ConnectResponse = response.json().await.unwrap();
    assert_eq!(
        connect.uri,
        format!("ws://127.0.0.1:{}/ws", server.addr.port())
    );

    let (mut ws, _) = connect_async(connect.uri.as_str()).await.unwrap();
    ws.send(Message::Text(connect.token.unwrap())).await.unwrap();
    let pid = expect_pid(&mut ws).await;
    assert_eq!(
        server.state.registry.lookup(pid).unwrap().owner.as_deref(),
        Some("alice")
    );

    ws.send(Message::Text("ls\n".into())).await.unwrap();
    let out = read_until(&mut ws, "relay-marker.txt").await;
    assert!(out.contains("relay-marker.txt"), "output was {out:?}");

    ws.close(None).await.unwrap();
    wait_for_sessions(&server.state, 0).await;
    let _ = std::fs::remove_dir_all(&workdir);
}

#[tokio::test]
async fn stalled_child_input_does_not_block_teardown() {
    let config = RelayConfig {
        shell_args: vec!["-c".to_string(), "sleep 60".to_string()],
        ..shell_config("/bin/sh")
    };
    let server = TestServer::start(config).await;
    let (mut ws, pid) = server.handshake("alice").await;

    // Far more input than the PTY will accept from a child that never reads.
    let frame = "x".repeat(1024);
    for _ in 0..3000 {
        timeout(WAIT, ws.send(Message::Text(frame.clone())))
            .await
            .expect("relay stopped reading input")
            .unwrap();
    }
    ws.send(Message::Text("\n".into())).await.unwrap();
    drop(ws);

    wait_for_sessions(&server.state, 0).await;
    assert!(server.state.registry.lookup(pid).is_err());
}

#[tokio::test]
async fn stalled_child_input_does_not_block_shutdown() {
    let config = RelayConfig {
        shell_args: vec!["-c".to_string(), "sleep 60".to_string()],
        ..shell_config("/bin/sh")
    };
    let server = TestServer::start(config).await;
    let (mut ws, _pid) = server.handshake("alice").await;

    let frame = "y".repeat(1024);
    for _ in 0..3000 {
        ws.send(Message::Text(frame.clone())).await.unwrap();
    }

    assert_eq!(server.state.registry.drain(WAIT).await, 0);
}

#[tokio::test]
async fn foreign_origin_cannot_open_relay() {
    let server = TestServer::start(shell_config("/bin/sh")).await;

    let mut request = format!("ws://{}/ws", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("origin", "https://evil.example".parse().unwrap());
    assert!(connect_async(request).await.is_err());

    let mut request = format!("ws://{}/ws", server.addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "origin",
        format!("http://{}", server.addr).parse().unwrap(),
    );
    assert!(connect_async(request).await.is_ok());
    assert_eq!(server.state.registry.session_count(), 0);
}

