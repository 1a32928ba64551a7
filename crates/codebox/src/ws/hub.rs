//! WebSocket hub: live connections and per-project subscriber sets.

use codebox_protocol::ServerEvent;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 256;

/// A sender for WebSocket messages to a specific client.
pub type WsSender = mpsc::Sender<ServerEvent>;

/// Identifier of one WebSocket connection.
pub type ConnectionId = u64;

/// Hub tracking connections and which project each one follows.
///
/// Membership is kept in both directions: project -> connections for
/// delivery, connection -> project so a connection is in at most one set and
/// disconnect can clean up.
pub struct WsHub {
    /// Connection ID -> outbox
    connections: DashMap<ConnectionId, WsSender>,

    /// Project ID -> subscribed connections
    project_subscribers: DashMap<String, HashSet<ConnectionId>>,

    /// Connection ID -> project it follows
    memberships: DashMap<ConnectionId, String>,

    next_id: AtomicU64,
}

impl WsHub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            project_subscribers: DashMap::new(),
            memberships: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection.
    ///
    /// Returns a receiver for events targeted at this connection and its ID.
    pub fn register_connection(&self) -> (mpsc::Receiver<ServerEvent>, ConnectionId) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(conn_id, tx);
        info!("Registered WebSocket connection {}", conn_id);
        (rx, conn_id)
    }

    /// Drop a connection and its membership. Running sandboxes are untouched.
    pub fn unregister_connection(&self, conn_id: ConnectionId) {
        self.leave(conn_id);
        if self.connections.remove(&conn_id).is_some() {
            info!("Unregistered WebSocket connection {}", conn_id);
        }
    }

    /// Make `project_id` the only project this connection follows.
    pub fn join_project(&self, conn_id: ConnectionId, project_id: &str) {
        self.leave(conn_id);
        self.project_subscribers
            .entry(project_id.to_string())
            .or_default()
            .insert(conn_id);
        self.memberships.insert(conn_id, project_id.to_string());
        debug!("Connection {} joined project {}", conn_id, project_id);
    }

    /// Remove the connection from whatever project it follows.
    pub fn leave(&self, conn_id: ConnectionId) {
        let Some((_, project_id)) = self.memberships.remove(&conn_id) else {
            return;
        };
        if let Some(mut subscribers) = self.project_subscribers.get_mut(&project_id) {
            subscribers.remove(&conn_id);
        }
        self.project_subscribers
            .remove_if(&project_id, |_, subscribers| subscribers.is_empty());
        debug!("Connection {} left project {}", conn_id, project_id);
    }

    /// The project a connection follows, if any.
    pub fn project_of(&self, conn_id: ConnectionId) -> Option<String> {
        self.memberships.get(&conn_id).map(|p| p.value().clone())
    }

    /// Connections currently subscribed to a project.
    pub fn subscribers(&self, project_id: &str) -> Vec<ConnectionId> {
        self.project_subscribers
            .get(project_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Send an event to one connection.
    pub async fn send_to_connection(&self, conn_id: ConnectionId, event: impl Into<ServerEvent>) {
        let tx = self.connections.get(&conn_id).map(|tx| tx.value().clone());
        let Some(tx) = tx else {
            debug!("Connection {} is gone, dropping event", conn_id);
            return;
        };
        if tx.send(event.into()).await.is_err() {
            warn!("Failed to send event to connection {}", conn_id);
        }
    }

    /// Send an event to every current subscriber of a project.
    pub async fn send_to_project(&self, project_id: &str, event: impl Into<ServerEvent>) {
        let event = event.into();
        let targets: Vec<(ConnectionId, WsSender)> = self
            .subscribers(project_id)
            .into_iter()
            .filter_map(|id| self.connections.get(&id).map(|tx| (id, tx.value().clone())))
            .collect();

        for (conn_id, tx) in targets {
            if tx.send(event.clone()).await.is_err() {
                warn!(
                    "Failed to send event for project {} to connection {}",
                    project_id, conn_id
                );
            }
        }
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}
