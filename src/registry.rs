//! Session registry.
//!
//! Tracks live sessions by process id and pending handshake tokens. One
//! registry is created at server start and shared with every handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::pty::PtyControl;

const TOKEN_BYTES: usize = 32;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A live shell as seen by the registry. Holds no ownership of the process;
/// only the relay that spawned it can write to or kill it.
pub struct PtySession {
    pub pid: u32,
    pub owner: Option<String>,
    pub created_at: Instant,
    control: Arc<PtyControl>,
}

impl PtySession {
    pub fn new(control: Arc<PtyControl>, owner: Option<String>) -> Self {
        Self {
            pid: control.pid(),
            owner,
            created_at: Instant::now(),
            control,
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> RelayResult<()> {
        self.control.resize(cols, rows)
    }

    /// `(cols, rows)` as reported by the OS.
    pub fn size(&self) -> RelayResult<(u16, u16)> {
        self.control.size()
    }

    pub fn is_alive(&self) -> bool {
        self.control.is_alive()
    }
}

/// An issued, not yet consumed connection token.
#[derive(Debug, Clone)]
pub struct PendingHandshake {
    pub identity: String,
    pub issued_at: Instant,
}

pub struct SessionRegistry {
    sessions: DashMap<u32, Arc<PtySession>>,
    tokens: DashMap<String, PendingHandshake>,
    token_ttl: Duration,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(token_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            token_ttl,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a single-use token bound to `identity`.
    pub fn issue_token(&self, identity: &str) -> String {
        self.purge_expired_tokens();

        let token = generate_token();
        self.tokens.insert(
            token.clone(),
            PendingHandshake {
                identity: identity.to_string(),
                issued_at: Instant::now(),
            },
        );
        info!(identity, pending = self.tokens.len(), "Handshake token issued");
        token
    }

    /// Remove the token and return its identity. A token can be consumed at
    /// most once, even by concurrent callers.
    pub fn consume_token(&self, token: &str) -> RelayResult<String> {
        let (_, pending) = self.tokens.remove(token).ok_or(RelayError::InvalidToken)?;
        if pending.issued_at.elapsed() > self.token_ttl {
            debug!(identity = %pending.identity, "Rejected expired handshake token");
            return Err(RelayError::InvalidToken);
        }
        Ok(pending.identity)
    }

    pub fn purge_expired_tokens(&self) {
        let ttl = self.token_ttl;
        self.tokens.retain(|_, pending| pending.issued_at.elapsed() <= ttl);
    }

    /// Add a freshly spawned session. An entry left behind by a process that
    /// has already been reaped is replaced, since the OS may hand its pid out
    /// again before the old relay has finished tearing down.
    pub fn register(&self, session: Arc<PtySession>) -> RelayResult<()> {
        let pid = session.pid;
        match self.sessions.entry(pid) {
            Entry::Occupied(mut slot) if !slot.get().is_alive() => {
                debug!(pid, "Replacing entry of an exited process");
                slot.insert(session);
                Ok(())
            }
            Entry::Occupied(_) => {
                warn!(pid, "Refusing to register a pid that is already live");
                Err(RelayError::DuplicateSession(pid))
            }
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Idempotent; returns the entry if it was still present.
    pub fn unregister(&self, pid: u32) -> Option<Arc<PtySession>> {
        self.sessions.remove(&pid).map(|(_, session)| session)
    }

    /// Remove `session` only if it is still the entry for its pid. Returns
    /// whether anything was removed.
    pub fn unregister_session(&self, session: &Arc<PtySession>) -> bool {
        self.sessions
            .remove_if(&session.pid, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn lookup(&self, pid: u32) -> RelayResult<Arc<PtySession>> {
        self.sessions
            .get(&pid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RelayError::UnknownSession(pid))
    }

    pub fn resize(&self, pid: u32, cols: u16, rows: u16) -> RelayResult<()> {
        let session = self.lookup(pid)?;
        session.resize(cols, rows)?;
        debug!(pid, cols, rows, "Session resized");
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancelled when the server stops; each relay listens on its own child.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Tell every relay to tear down, then wait for the session map to empty.
    /// Returns the number of sessions still registered at the deadline.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.shutdown.cancel();
        self.tokens.clear();

        let deadline = Instant::now() + timeout;
        while !self.sessions.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let remaining = self.sessions.len();
        if remaining > 0 {
            warn!(remaining, "Sessions still registered after drain timeout");
        } else {
            info!("All sessions drained");
        }
        remaining
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
