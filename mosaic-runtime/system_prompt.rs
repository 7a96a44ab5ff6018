//! L9: deterministic rendering of mesh topology into the text preamble
//! consumed by agent sessions.

use std::collections::HashSet;
use std::sync::Arc;

use crate::event::EventType;
use crate::model::ModelStore;

pub struct SystemPromptBuilder {
    store: Arc<dyn ModelStore>,
}

impl SystemPromptBuilder {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self { store }
    }

    pub async fn generate(&self, mesh_id: &str, node_id: &str, session_id: &str) -> String {
        let mut nodes = self.store.list_nodes(mesh_id).await;
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let mut subscriptions = self.store.list_subscriptions(mesh_id).await;
        subscriptions.sort_by(|a, b| {
            (a.source_node_id.as_str(), a.target_node_id.as_str())
                .cmp(&(b.source_node_id.as_str(), b.target_node_id.as_str()))
        });

        let sub_pairs: HashSet<(String, String)> = subscriptions
            .iter()
            .map(|s| (s.source_node_id.clone(), s.target_node_id.clone()))
            .collect();

        let mut connections = self.store.list_connections(mesh_id).await;
        connections.sort_by(|a, b| {
            (a.source_node_id.as_str(), a.target_node_id.as_str())
                .cmp(&(b.source_node_id.as_str(), b.target_node_id.as_str()))
        });
        let filtered_connections: Vec<_> = connections
            .iter()
            .filter(|c| !sub_pairs.contains(&(c.source_node_id.clone(), c.target_node_id.clone())))
            .collect();

        let mut out = String::new();
        out.push_str("You are now a node operating within the Mosaic Event Mesh system.\n\n");
        out.push_str("[Identity]\n");
        out.push_str(&format!("Node ID: {node_id}\n\n"));
        out.push_str("[Current Session]\n");
        out.push_str(&format!("Session ID: {session_id}\n\n"));
        out.push_str("[Nodes In Mesh]\n");
        for n in &nodes {
            out.push_str(&format!("- {}\n", n.node_id));
        }

        if !subscriptions.is_empty() || !filtered_connections.is_empty() {
            out.push_str("\n[Network Topology]\ngraph LR\n");
            for s in &subscriptions {
                out.push_str(&format!(
                    "    {} --> |{}| {}\n",
                    s.source_node_id,
                    s.event_type.as_str(),
                    s.target_node_id
                ));
            }
            for c in &filtered_connections {
                out.push_str(&format!("    {} --> {}\n", c.source_node_id, c.target_node_id));
            }
        }

        out.push_str("\n[Event Definitions]\n");
        for event_type in EventType::all() {
            out.push_str(&format!("{}:\n", event_type.as_str()));
            out.push_str(&format!("    - description: {}\n", event_type.description()));
            if let Some(schema) = event_type.payload_schema_json() {
                out.push_str(&format!("    - payload_schema: {}\n", schema));
            }
        }

        out.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Connection, InMemoryStore, Node, SessionAlignment, Subscription};
    use serde_json::json;
    use std::path::PathBuf;

    fn mk_node(mesh: &str, id: &str) -> Node {
        Node {
            node_id: id.to_string(),
            node_type: "agent".to_string(),
            mesh_id: mesh.to_string(),
            user_id: "u1".to_string(),
            config: json!({}),
            workspace: PathBuf::from("/tmp"),
            auto_start: false,
        }
    }

    #[tokio::test]
    async fn renders_nodes_and_topology() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_node(mk_node("1", "10")).await;
        store.insert_node(mk_node("1", "20")).await;
        store
            .insert_connection(Connection {
                mesh_id: "1".to_string(),
                source_node_id: "10".to_string(),
                target_node_id: "20".to_string(),
                session_alignment: SessionAlignment::Mirroring,
            })
            .await;
        store
            .insert_subscription(Subscription {
                mesh_id: "1".to_string(),
                source_node_id: "10".to_string(),
                target_node_id: "20".to_string(),
                event_type: EventType::NodeMessage,
            })
            .await;

        let builder = SystemPromptBuilder::new(store);
        let prompt = builder.generate("1", "10", "S1").await;

        assert!(prompt.contains("Node ID: 10"));
        assert!(prompt.contains("- 20"));
        assert!(prompt.contains("10 --> |node_message| 20"));
        // the connection is covered by the subscription, so it must not
        // also appear as a bare topology edge
        assert_eq!(prompt.matches("10 --> 20").count(), 0);
    }

    #[tokio::test]
    async fn connection_without_subscription_still_renders() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_node(mk_node("1", "10")).await;
        store.insert_node(mk_node("1", "20")).await;
        store
            .insert_connection(Connection {
                mesh_id: "1".to_string(),
                source_node_id: "10".to_string(),
                target_node_id: "20".to_string(),
                session_alignment: SessionAlignment::Tasking,
            })
            .await;

        let builder = SystemPromptBuilder::new(store);
        let prompt = builder.generate("1", "10", "S1").await;
        assert!(prompt.contains("10 --> 20"));
    }
}
