//! L8: persistent mapping between paired session ids across connected
//! nodes; implements the two alignment policies (§4.8).

use std::sync::Arc;
use uuid::Uuid;

use crate::model::{ModelStore, SessionAlignment};

pub struct SessionRouter {
    store: Arc<dyn ModelStore>,
}

impl SessionRouter {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self { store }
    }

    /// Resolve the downstream session id for an emission from
    /// `(source_node, upstream_session)` toward `target_node`, under the
    /// given alignment policy. Mints and persists a fresh pair when
    /// `tasking`, or when `mirroring` finds no existing row.
    pub async fn resolve(
        &self,
        mesh_id: &str,
        source_node: &str,
        upstream_session: &str,
        target_node: &str,
        align: SessionAlignment,
    ) -> String {
        if align == SessionAlignment::Tasking {
            let fresh = Uuid::new_v4().to_string();
            self.store
                .routing_insert_pair(mesh_id, source_node, upstream_session, target_node, &fresh)
                .await;
            return fresh;
        }

        if let Some(existing) = self
            .store
            .routing_lookup(mesh_id, source_node, upstream_session, target_node)
            .await
        {
            return existing;
        }

        let fresh = Uuid::new_v4().to_string();
        self.store
            .routing_insert_pair(mesh_id, source_node, upstream_session, target_node, &fresh)
            .await;
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InMemoryStore;

    #[tokio::test]
    async fn mirroring_reuses_existing_pair() {
        let router = SessionRouter::new(Arc::new(InMemoryStore::new()));
        let first = router
            .resolve("1", "10", "S1", "20", SessionAlignment::Mirroring)
            .await;
        let second = router
            .resolve("1", "10", "S1", "20", SessionAlignment::Mirroring)
            .await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn tasking_always_mints_fresh_session() {
        let router = SessionRouter::new(Arc::new(InMemoryStore::new()));
        let first = router
            .resolve("1", "10", "S1", "20", SessionAlignment::Tasking)
            .await;
        let second = router
            .resolve("1", "10", "S1", "20", SessionAlignment::Tasking)
            .await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn routing_lookup_commutes() {
        let store = Arc::new(InMemoryStore::new());
        let router = SessionRouter::new(store.clone());
        let downstream = router
            .resolve("1", "10", "S1", "20", SessionAlignment::Mirroring)
            .await;
        let back = store.routing_lookup("1", "20", &downstream, "10").await;
        assert_eq!(back, Some("S1".to_string()));
    }
}
