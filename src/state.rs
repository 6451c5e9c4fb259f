use std::sync::Arc;

use crate::config::RelayConfig;
use crate::identity::{IdentityProvider, ProcessOwner};
use crate::registry::SessionRegistry;

/// Shared state handed to every HTTP and websocket handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<SessionRegistry>,
    pub identity: Arc<dyn IdentityProvider>,
    /// Port the control API is actually bound to.
    pub control_port: u16,
}

impl AppState {
    pub fn new(config: RelayConfig, identity: Arc<dyn IdentityProvider>, control_port: u16) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.token_ttl));
        Self {
            config: Arc::new(config),
            registry,
            identity,
            control_port,
        }
    }

    /// State with default identity resolution, mostly for tests.
    pub fn with_config(config: RelayConfig, control_port: u16) -> Self {
        Self::new(config, Arc::new(ProcessOwner), control_port)
    }
}
