//! The declarative model entities and the store interface the runtime
//! core consumes. Persistence itself is an external collaborator; this
//! module defines the trait the core depends on plus the in-memory
//! implementation this repository ships.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::error::MosaicError;
use crate::event::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum SessionAlignment {
    #[default]
    Mirroring,
    Tasking,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Chat,
    Background,
    Program,
}

impl SessionMode {
    /// A node's `config.mode` selects the session mode new sessions get
    /// created with; unset or unrecognized values default to background
    /// (events published to the mesh), matching the node's declarative
    /// configuration rather than a hardcoded default.
    pub fn from_config(config: &Value) -> Self {
        match config.get("mode").and_then(Value::as_str) {
            Some("chat") => SessionMode::Chat,
            Some("program") => SessionMode::Program,
            _ => SessionMode::Background,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mesh {
    pub mesh_id: String,
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_type: String,
    pub mesh_id: String,
    pub user_id: String,
    pub config: Value,
    pub workspace: PathBuf,
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub mesh_id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub session_alignment: SessionAlignment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub mesh_id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub event_type: EventType,
}

/// One direction of a routing pair. Rows are always inserted forward +
/// backward together (§3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRouting {
    pub mesh_id: String,
    pub local_node: String,
    pub local_session: String,
    pub remote_node: String,
    pub remote_session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub message_count: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost_usd: 0.0,
            message_count: 0,
            last_activity_at: None,
            closed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub mesh_id: String,
    pub node_id: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub r#type: String,
    pub content: String,
    pub sequence: u64,
}

/// CRUD + lookup surface the runtime core depends on. One async-trait,
/// object-safe, following the teacher's `Arc<dyn ...Repository>` pattern.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn get_mesh(&self, mesh_id: &str) -> Option<Mesh>;
    async fn insert_mesh(&self, mesh: Mesh);

    async fn list_nodes(&self, mesh_id: &str) -> Vec<Node>;
    async fn get_node(&self, mesh_id: &str, node_id: &str) -> Option<Node>;
    async fn insert_node(&self, node: Node);

    async fn list_connections(&self, mesh_id: &str) -> Vec<Connection>;
    async fn get_connection(
        &self,
        mesh_id: &str,
        source_node_id: &str,
        target_node_id: &str,
    ) -> Option<Connection>;
    async fn insert_connection(&self, connection: Connection);

    async fn list_subscriptions(&self, mesh_id: &str) -> Vec<Subscription>;
    async fn subscriptions_from(
        &self,
        mesh_id: &str,
        source_node_id: &str,
        event_type: EventType,
    ) -> Vec<Subscription>;
    async fn insert_subscription(&self, subscription: Subscription);

    async fn routing_lookup(
        &self,
        mesh_id: &str,
        local_node: &str,
        local_session: &str,
        remote_node: &str,
    ) -> Option<String>;

    /// Insert both the forward and backward routing rows as one unit of
    /// work (§3 "Stored bidirectionally").
    async fn routing_insert_pair(
        &self,
        mesh_id: &str,
        node_a: &str,
        session_a: &str,
        node_b: &str,
        session_b: &str,
    );

    async fn create_session(&self, record: SessionRecord);
    async fn get_session(&self, session_id: &str) -> Option<SessionRecord>;
    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), MosaicError>;
    async fn record_turn_stats(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Result<(), MosaicError>;
    async fn touch_activity(&self, session_id: &str) -> Result<(), MosaicError>;

    /// Append a message, assigning it the next contiguous sequence number
    /// for its session (§3 Message invariant). Returns the stored row.
    async fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        r#type: &str,
        content: String,
    ) -> Result<Message, MosaicError>;
}
