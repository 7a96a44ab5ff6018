//! L7: fan-out from worker scheduler threads to the WebSocket
//! connections of a user. Workers only ever call `push_from_worker`;
//! they never touch a connection directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::model::MessageRole;

pub type ConnectionId = u64;

/// The §6 user-channel message shape, as delivered to a connected client.
#[derive(Debug, Clone, Serialize)]
pub struct UserMessage {
    pub session_id: String,
    pub r#type: String,
    pub role: MessageRole,
    pub content: Value,
    pub message_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

struct Connection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<UserMessage>,
}

/// One entry per user, each holding every socket that user currently has
/// open (a user may be connected from more than one client at once).
#[derive(Default)]
pub struct UserBroker {
    connections: RwLock<HashMap<String, Vec<Connection>>>,
    next_id: AtomicU64,
}

impl UserBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `user_id`. The caller owns the
    /// returned receiver and is responsible for forwarding messages to
    /// the actual transport (e.g. a WebSocket send loop).
    pub async fn connect_user(
        &self,
        user_id: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<UserMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .push(Connection { id, tx });
        (id, rx)
    }

    /// Remove one connection. A no-op if it is already gone.
    pub async fn disconnect_user(&self, user_id: &str, connection_id: ConnectionId) {
        let mut connections = self.connections.write().await;
        if let Some(conns) = connections.get_mut(user_id) {
            conns.retain(|c| c.id != connection_id);
            if conns.is_empty() {
                connections.remove(user_id);
            }
        }
    }

    /// Remove every connection for `user_id`, e.g. on forced session
    /// teardown.
    pub async fn disconnect_all(&self, user_id: &str) {
        self.connections.write().await.remove(user_id);
    }

    /// The only entry point worker scheduler threads use. Fans the
    /// message out to every live connection for the user; a dead
    /// receiver is logged and skipped, never treated as fatal.
    pub async fn push_from_worker(&self, user_id: &str, message: UserMessage) {
        let connections = self.connections.read().await;
        let Some(conns) = connections.get(user_id) else {
            return;
        };
        for conn in conns {
            if conn.tx.send(message.clone()).is_err() {
                warn!(user_id = %user_id, connection_id = conn.id, "dropping message: connection gone");
            }
        }
    }
}
