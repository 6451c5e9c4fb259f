use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderName;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use xterm_relay::config::{resolve_default_shell, simple_relay_port, DEFAULT_BIND, DEFAULT_TERM};
use xterm_relay::identity::{IdentityProvider, ProcessOwner, TrustedHeader};
use xterm_relay::{build_router, build_simple_router, AppState, RelayConfig, RelayMode};

/// Relay browser terminals to server-side PTY shells.
#[derive(Parser, Debug)]
#[command(name = "xterm-relay")]
#[command(about = "WebSocket relay between browser terminals and PTY shells")]
struct Args {
    /// Address of the control API (and the relay in token mode)
    #[arg(long, env = "XTERM_RELAY_BIND", default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// How relay connections are authenticated
    #[arg(long, env = "XTERM_RELAY_MODE", value_enum, default_value = "token")]
    mode: RelayMode,

    /// Shell to spawn (default: $SHELL, then bash, then sh)
    #[arg(long, env = "XTERM_RELAY_SHELL")]
    shell: Option<String>,

    /// Extra argument for the shell, repeatable
    #[arg(long = "shell-arg", allow_hyphen_values = true)]
    shell_args: Vec<String>,

    /// Working directory for spawned shells (default: current directory)
    #[arg(long, env = "XTERM_RELAY_CWD")]
    cwd: Option<PathBuf>,

    /// TERM exported to spawned shells
    #[arg(long, env = "XTERM_RELAY_TERM", default_value = DEFAULT_TERM)]
    term: String,

    /// Seconds an issued token stays valid
    #[arg(long, env = "XTERM_RELAY_TOKEN_TTL_SECS", default_value_t = 60)]
    token_ttl_secs: u64,

    /// Seconds to wait for a connection to present its token
    #[arg(long, env = "XTERM_RELAY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    handshake_timeout_secs: u64,

    /// Log in as the session identity with `su -` instead of running the shell
    #[arg(long, env = "XTERM_RELAY_LOGIN_SHELL")]
    login_shell: bool,

    /// Header set by an authenticating proxy that names the caller
    #[arg(long, env = "XTERM_RELAY_IDENTITY_HEADER")]
    identity_header: Option<String>,

    /// Accept the identity a client names in /api/connect when the caller
    /// cannot be identified otherwise
    #[arg(long, env = "XTERM_RELAY_TRUST_CLIENT_IDENTITY")]
    trust_client_identity: bool,

    /// Browser origin allowed to use the API and relay, repeatable
    #[arg(long = "allowed-origin", env = "XTERM_RELAY_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Directory with a browser client to serve
    #[arg(long, env = "STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind: self.bind,
            mode: self.mode,
            shell: self.shell.clone().unwrap_or_else(resolve_default_shell),
            shell_args: self.shell_args.clone(),
            cwd: self.cwd.clone().or_else(|| std::env::current_dir().ok()),
            term: self.term.clone(),
            login_shell: self.login_shell,
            trust_client_identity: self.trust_client_identity,
            allowed_origins: self.allowed_origins.clone(),
            token_ttl: Duration::from_secs(self.token_ttl_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            static_dir: self.static_dir.clone(),
            ..RelayConfig::default()
        }
    }

    fn identity_provider(&self) -> anyhow::Result<Arc<dyn IdentityProvider>> {
        match &self.identity_header {
            Some(name) => {
                let header = HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("invalid identity header `{name}`"))?;
                Ok(Arc::new(TrustedHeader::new(header)))
            }
            None => Ok(Arc::new(ProcessOwner)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::default().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = args.relay_config();
    let identity = args.identity_provider()?;

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let control_addr = listener.local_addr()?;
    let state = AppState::new(config, identity, control_addr.port());

    info!(
        addr = %control_addr,
        mode = ?state.config.mode,
        shell = %state.config.shell,
        token_ttl_secs = state.config.token_ttl.as_secs(),
        "Starting xterm-relay"
    );

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        let registry = Arc::clone(&state.registry);
        let timeout = state.config.shutdown_timeout;
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown requested, draining sessions");
            registry.drain(timeout).await;
            stop.cancel();
        });
    }

    let control = {
        let stop = stop.clone();
        axum::serve(listener, build_router(state.clone()))
            .tcp_nodelay(true)
            .with_graceful_shutdown(async move { stop.cancelled().await })
    };

    match state.config.mode {
        RelayMode::Token => control.await?,
        RelayMode::Simple => {
            let relay_addr = SocketAddr::new(control_addr.ip(), simple_relay_port(control_addr.port()));
            let relay_listener = TcpListener::bind(relay_addr)
                .await
                .with_context(|| format!("failed to bind relay port {relay_addr}"))?;
            info!(addr = %relay_addr, "Simple relay listening");

            let relay = axum::serve(relay_listener, build_simple_router(state.clone()))
                .tcp_nodelay(true)
                .with_graceful_shutdown(async move { stop.cancelled().await });
            tokio::try_join!(control.into_future(), relay.into_future())?;
        }
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
