use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{
    Connection, Mesh, Message, MessageRole, ModelStore, Node, SessionRecord, SessionRouting,
    SessionStatus, Subscription,
};
use crate::error::MosaicError;
use crate::event::EventType;

/// Default, database-free implementation of `ModelStore`. Guards each
/// entity collection with its own lock, the same shape as the teacher's
/// `Arc<RwLock<HashMap<...>>>` caches in its app state.
#[derive(Default)]
pub struct InMemoryStore {
    meshes: RwLock<HashMap<String, Mesh>>,
    nodes: RwLock<HashMap<(String, String), Node>>,
    connections: RwLock<HashMap<(String, String, String), Connection>>,
    subscriptions: RwLock<Vec<Subscription>>,
    routing: RwLock<Vec<SessionRouting>>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModelStore for InMemoryStore {
    async fn get_mesh(&self, mesh_id: &str) -> Option<Mesh> {
        self.meshes.read().unwrap().get(mesh_id).cloned()
    }

    async fn insert_mesh(&self, mesh: Mesh) {
        self.meshes.write().unwrap().insert(mesh.mesh_id.clone(), mesh);
    }

    async fn list_nodes(&self, mesh_id: &str) -> Vec<Node> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .filter(|n| n.mesh_id == mesh_id)
            .cloned()
            .collect()
    }

    async fn get_node(&self, mesh_id: &str, node_id: &str) -> Option<Node> {
        self.nodes
            .read()
            .unwrap()
            .get(&(mesh_id.to_string(), node_id.to_string()))
            .cloned()
    }

    async fn insert_node(&self, node: Node) {
        self.nodes
            .write()
            .unwrap()
            .insert((node.mesh_id.clone(), node.node_id.clone()), node);
    }

    async fn list_connections(&self, mesh_id: &str) -> Vec<Connection> {
        self.connections
            .read()
            .unwrap()
            .values()
            .filter(|c| c.mesh_id == mesh_id)
            .cloned()
            .collect()
    }

    async fn get_connection(
        &self,
        mesh_id: &str,
        source_node_id: &str,
        target_node_id: &str,
    ) -> Option<Connection> {
        self.connections
            .read()
            .unwrap()
            .get(&(
                mesh_id.to_string(),
                source_node_id.to_string(),
                target_node_id.to_string(),
            ))
            .cloned()
    }

    async fn insert_connection(&self, connection: Connection) {
        self.connections.write().unwrap().insert(
            (
                connection.mesh_id.clone(),
                connection.source_node_id.clone(),
                connection.target_node_id.clone(),
            ),
            connection,
        );
    }

    async fn list_subscriptions(&self, mesh_id: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.mesh_id == mesh_id)
            .cloned()
            .collect()
    }

    async fn subscriptions_from(
        &self,
        mesh_id: &str,
        source_node_id: &str,
        event_type: EventType,
    ) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .unwrap()
            .iter()
            .filter(|s| {
                s.mesh_id == mesh_id
                    && s.source_node_id == source_node_id
                    && s.event_type.as_str() == event_type.as_str()
            })
            .cloned()
            .collect()
    }

    async fn insert_subscription(&self, subscription: Subscription) {
        self.subscriptions.write().unwrap().push(subscription);
    }

    async fn routing_lookup(
        &self,
        mesh_id: &str,
        local_node: &str,
        local_session: &str,
        remote_node: &str,
    ) -> Option<String> {
        self.routing
            .read()
            .unwrap()
            .iter()
            .find(|r| {
                r.mesh_id == mesh_id
                    && r.local_node == local_node
                    && r.local_session == local_session
                    && r.remote_node == remote_node
            })
            .map(|r| r.remote_session.clone())
    }

    async fn routing_insert_pair(
        &self,
        mesh_id: &str,
        node_a: &str,
        session_a: &str,
        node_b: &str,
        session_b: &str,
    ) {
        let mut rows = self.routing.write().unwrap();
        rows.push(SessionRouting {
            mesh_id: mesh_id.to_string(),
            local_node: node_a.to_string(),
            local_session: session_a.to_string(),
            remote_node: node_b.to_string(),
            remote_session: session_b.to_string(),
        });
        rows.push(SessionRouting {
            mesh_id: mesh_id.to_string(),
            local_node: node_b.to_string(),
            local_session: session_b.to_string(),
            remote_node: node_a.to_string(),
            remote_session: session_a.to_string(),
        });
    }

    async fn create_session(&self, record: SessionRecord) {
        self.sessions
            .write()
            .unwrap()
            .insert(record.session_id.clone(), record);
    }

    async fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), MosaicError> {
        let mut sessions = self.sessions.write().unwrap();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| MosaicError::SessionNotFound(session_id.to_string()))?;
        record.status = status;
        if matches!(status, SessionStatus::Closed) {
            record.stats.closed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_turn_stats(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Result<(), MosaicError> {
        let mut sessions = self.sessions.write().unwrap();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| MosaicError::SessionNotFound(session_id.to_string()))?;
        record.stats.total_input_tokens += input_tokens;
        record.stats.total_output_tokens += output_tokens;
        record.stats.total_cost_usd += cost_usd;
        record.stats.last_activity_at = Some(Utc::now());
        Ok(())
    }

    async fn touch_activity(&self, session_id: &str) -> Result<(), MosaicError> {
        let mut sessions = self.sessions.write().unwrap();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| MosaicError::SessionNotFound(session_id.to_string()))?;
        record.stats.last_activity_at = Some(Utc::now());
        Ok(())
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        r#type: &str,
        content: String,
    ) -> Result<Message, MosaicError> {
        if !self.sessions.read().unwrap().contains_key(session_id) {
            return Err(MosaicError::SessionNotFound(session_id.to_string()));
        }
        let mut messages = self.messages.write().unwrap();
        let rows = messages.entry(session_id.to_string()).or_default();
        let sequence = rows.len() as u64 + 1;
        let message = Message {
            message_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            r#type: r#type.to_string(),
            content,
            sequence,
        };
        rows.push(message.clone());
        drop(messages);
        if let Some(record) = self.sessions.write().unwrap().get_mut(session_id) {
            record.stats.message_count += 1;
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionMode, SessionRecord, SessionStats};

    fn sample_session(id: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            user_id: "u1".to_string(),
            mesh_id: "1".to_string(),
            node_id: "10".to_string(),
            mode: SessionMode::Chat,
            status: SessionStatus::Active,
            stats: SessionStats::default(),
        }
    }

    #[tokio::test]
    async fn messages_get_contiguous_monotonic_sequence() {
        let store = InMemoryStore::new();
        store.create_session(sample_session("s1")).await;
        let m1 = store
            .append_message("s1", MessageRole::User, "user_message", "hi".into())
            .await
            .unwrap();
        let m2 = store
            .append_message("s1", MessageRole::Assistant, "assistant_text", "hello".into())
            .await
            .unwrap();
        assert_eq!(m1.sequence, 1);
        assert_eq!(m2.sequence, 2);
    }

    #[tokio::test]
    async fn routing_insert_pair_is_bidirectional() {
        let store = InMemoryStore::new();
        store.routing_insert_pair("1", "10", "S1", "20", "S2").await;
        assert_eq!(
            store.routing_lookup("1", "10", "S1", "20").await,
            Some("S2".to_string())
        );
        assert_eq!(
            store.routing_lookup("1", "20", "S2", "10").await,
            Some("S1".to_string())
        );
    }

    #[tokio::test]
    async fn append_message_on_unknown_session_fails() {
        let store = InMemoryStore::new();
        let err = store
            .append_message("missing", MessageRole::User, "user_message", "hi".into())
            .await;
        assert!(err.is_err());
    }
}
