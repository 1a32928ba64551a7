//! Application state shared across handlers.

use std::sync::Arc;

use crate::session::SessionService;
use crate::ws::WsHub;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Session dispatcher.
    pub sessions: Arc<SessionService>,
    /// WebSocket hub.
    pub hub: Arc<WsHub>,
    /// Origins allowed to make cross-origin requests. Empty allows any.
    pub allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self {
            hub: sessions.hub().clone(),
            sessions,
            allowed_origins: Arc::new(Vec::new()),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Arc::new(origins);
        self
    }
}
