//! Server configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_BIND: &str = "127.0.0.1:39383";
pub const DEFAULT_TERM: &str = "xterm-256color";

/// How a websocket connection is authenticated before a shell is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RelayMode {
    /// The first frame must carry a token issued by `/api/connect`.
    Token,
    /// A shell is spawned as soon as a socket connects on the relay port.
    Simple,
}

/// Runtime configuration shared by every handler.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub mode: RelayMode,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub term: String,
    /// Spawn `su - <identity>` instead of `shell` when an identity is known.
    pub login_shell: bool,
    /// Accept the `identity` field of `/api/connect` when the identity
    /// provider resolves nobody. Off unless a front end vouches for it.
    pub trust_client_identity: bool,
    /// Browser origins allowed besides the server's own.
    pub allowed_origins: Vec<String>,
    pub token_ttl: Duration,
    pub handshake_timeout: Duration,
    /// How long to keep forwarding output after the process has exited.
    pub exit_drain_grace: Duration,
    pub shutdown_timeout: Duration,
    pub static_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 39383)),
            mode: RelayMode::Token,
            shell: resolve_default_shell(),
            shell_args: Vec::new(),
            cwd: None,
            term: DEFAULT_TERM.to_string(),
            login_shell: false,
            trust_client_identity: false,
            allowed_origins: Vec::new(),
            token_ttl: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            exit_drain_grace: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(5),
            static_dir: None,
        }
    }
}

/// Port the simple-mode relay listens on, one above the control port.
pub fn simple_relay_port(control_port: u16) -> u16 {
    control_port.wrapping_add(1)
}

/// Treats a missing or zero dimension as the default.
pub fn dimension_or_default(value: Option<u16>, default: u16) -> u16 {
    match value {
        Some(v) if v > 0 => v,
        _ => default,
    }
}

#[cfg(windows)]
pub fn resolve_default_shell() -> String {
    "cmd.exe".to_string()
}

#[cfg(not(windows))]
pub fn resolve_default_shell() -> String {
    if let Ok(shell_env) = std::env::var("SHELL") {
        if !shell_env.is_empty() && Path::new(&shell_env).exists() {
            return shell_env;
        }
    }

    for candidate in ["/bin/bash", "/usr/bin/bash", "/bin/sh", "/usr/bin/sh"] {
        if Path::new(candidate).exists() {
            return candidate.to_string();
        }
    }

    "/bin/sh".to_string()
}
