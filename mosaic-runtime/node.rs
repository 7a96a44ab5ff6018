//! L4: owns a node's sessions; validates and dispatches inbound
//! envelopes; provides the publish-event service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::broker::{Client, EnvelopeCallback};
use crate::driver::Driver;
use crate::error::MosaicError;
use crate::event::{Envelope, EventPayload, EventType};
use crate::model::{ModelStore, SessionAlignment, SessionMode};
use crate::session::{AgentSession, AggregatorSession, EventPublisher, Session};
use crate::session_router::SessionRouter;
use crate::system_prompt::SystemPromptBuilder;
use crate::user_broker::UserBroker;

/// What kind of concrete Session a node instantiates for a given
/// downstream session id (§4.3 "concrete kinds in scope").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Agent,
    Aggregator,
}

impl NodeKind {
    pub fn parse(node_type: &str) -> Self {
        match node_type {
            "aggregator" => NodeKind::Aggregator,
            _ => NodeKind::Agent,
        }
    }
}

/// Builds a fresh `Driver` for a new agent session. Separated from Node
/// so tests can substitute `ScriptedDriver` without a real subprocess.
pub trait DriverFactory: Send + Sync {
    fn build(&self) -> Box<dyn Driver>;
}

pub struct Node {
    pub node_id: String,
    pub mesh_id: String,
    pub user_id: String,
    kind: NodeKind,
    config: Value,
    store: Arc<dyn ModelStore>,
    client: Client,
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
    running: AtomicBool,
    user_broker: Arc<UserBroker>,
    system_prompt_builder: Arc<SystemPromptBuilder>,
    session_router: Arc<SessionRouter>,
    driver_factory: Arc<dyn DriverFactory>,
    self_ref: std::sync::OnceLock<Weak<Node>>,
}

struct NodeHandle(Weak<Node>);

#[async_trait]
impl EventPublisher for NodeHandle {
    async fn publish(
        &self,
        session_id: &str,
        event_type: EventType,
        payload: Value,
        target_node_id: Option<String>,
    ) -> Result<(), MosaicError> {
        let Some(node) = self.0.upgrade() else {
            return Err(MosaicError::NotRunning("node".to_string()));
        };
        node.publish_event(session_id, event_type, payload, target_node_id).await
    }
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        mesh_id: String,
        user_id: String,
        node_type: &str,
        config: Value,
        broker: Arc<crate::broker::Broker>,
        store: Arc<dyn ModelStore>,
        user_broker: Arc<UserBroker>,
        system_prompt_builder: Arc<SystemPromptBuilder>,
        session_router: Arc<SessionRouter>,
        driver_factory: Arc<dyn DriverFactory>,
    ) -> Arc<Self> {
        let client = Client::new(broker, mesh_id.clone(), node_id.clone());
        let node = Arc::new(Self {
            node_id,
            mesh_id,
            user_id,
            kind: NodeKind::parse(node_type),
            config,
            store,
            client,
            sessions: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            user_broker,
            system_prompt_builder,
            session_router,
            driver_factory,
            self_ref: std::sync::OnceLock::new(),
        });
        let _ = node.self_ref.set(Arc::downgrade(&node));
        node
    }

    fn handle(&self) -> Arc<dyn EventPublisher> {
        let weak = self.self_ref.get().cloned().unwrap_or_default();
        Arc::new(NodeHandle(weak))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), fields(node = %format!("{}#{}", self.mesh_id, self.node_id)))]
    pub async fn start(self: &Arc<Self>) -> Result<(), MosaicError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MosaicError::AlreadyStarted(self.node_id.clone()));
        }
        let this = Arc::clone(self);
        let callback: EnvelopeCallback = Arc::new(move |envelope| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                this.on_envelope(envelope).await;
            })
        });
        self.client.connect(callback).await;
        info!(node_id = %self.node_id, "node started");
        Ok(())
    }

    #[instrument(skip(self), fields(node = %format!("{}#{}", self.mesh_id, self.node_id)))]
    pub async fn stop(&self) -> Result<(), MosaicError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(MosaicError::NotRunning(self.node_id.clone()));
        }
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.close_session(&id, true).await;
        }
        self.client.disconnect().await;
        info!(node_id = %self.node_id, "node stopped");
        Ok(())
    }

    pub async fn create_session(&self, session_id: &str) -> Result<Arc<dyn Session>, MosaicError> {
        if self.sessions.read().await.contains_key(session_id) {
            return Err(MosaicError::SessionNotFound(format!(
                "session {session_id} already exists"
            )));
        }
        let session: Arc<dyn Session> = match self.kind {
            NodeKind::Aggregator => Arc::new(AggregatorSession::new(session_id.to_string())),
            NodeKind::Agent => {
                let driver = self.driver_factory.build();
                let agent = AgentSession::new(
                    session_id.to_string(),
                    self.user_id.clone(),
                    self.mesh_id.clone(),
                    self.node_id.clone(),
                    SessionMode::from_config(&self.config),
                    driver,
                    Arc::clone(&self.store),
                    Arc::clone(&self.user_broker),
                    self.handle(),
                );
                let prompt = self
                    .system_prompt_builder
                    .generate(&self.mesh_id, &self.node_id, session_id)
                    .await;
                agent.set_system_prompt(prompt).await;
                agent
            }
        };
        session.start().await?;
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    pub async fn close_session(&self, session_id: &str, force: bool) -> Result<(), MosaicError> {
        let session = self.sessions.write().await.remove(session_id);
        let Some(session) = session else {
            warn!(session_id = %session_id, "close_session: not found");
            return Ok(());
        };
        session.close(force).await
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Inbound dispatch (§4.4 onEnvelope).
    #[instrument(skip(self, envelope), fields(event_type = ?envelope.event_type, event_id = %envelope.event_id))]
    pub async fn on_envelope(&self, envelope: Envelope) {
        if let Err(e) = EventPayload::validate(envelope.event_type, envelope.payload.clone()) {
            warn!(error = %e, "onEnvelope: schema invalid, dropping");
            return;
        }
        if envelope.target_id != self.node_id {
            warn!(
                expected = %self.node_id,
                got = %envelope.target_id,
                "onEnvelope: target mismatch, dropping"
            );
            return;
        }

        let downstream_id = envelope.downstream_session_id.clone();
        let session = match self.get_session(&downstream_id).await {
            Some(s) => s,
            None => match self.create_session(&downstream_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, session_id = %downstream_id, "onEnvelope: failed to auto-create session");
                    return;
                }
            },
        };

        if let Err(e) = session.process_event(envelope.clone()).await {
            warn!(error = %e, session_id = %downstream_id, "onEnvelope: error processing event in session");
        }

        let connection = self
            .store
            .get_connection(&self.mesh_id, &envelope.source_id, &self.node_id)
            .await;
        match connection {
            Some(conn) if conn.session_alignment == SessionAlignment::Tasking => {
                let _ = self.close_session(&downstream_id, false).await;
            }
            Some(_) if envelope.event_type == EventType::SessionEnd => {
                let _ = self.close_session(&downstream_id, false).await;
            }
            None => {
                warn!(
                    source = %envelope.source_id,
                    target = %self.node_id,
                    "onEnvelope: no connection found for alignment lookup"
                );
            }
            _ => {}
        }
    }

    /// Outbound publish (§4.4). `target_node_id = None` means pub/sub:
    /// fan out to every Subscription for `event_type` from this node.
    pub async fn publish_event(
        &self,
        session_id: &str,
        event_type: EventType,
        payload: Value,
        target_node_id: Option<String>,
    ) -> Result<(), MosaicError> {
        EventPayload::validate(event_type, payload.clone())?;

        match target_node_id {
            Some(target) => {
                if self
                    .store
                    .get_connection(&self.mesh_id, &self.node_id, &target)
                    .await
                    .is_none()
                {
                    warn!(source = %self.node_id, target = %target, "publish: no connection, dropping");
                    return Err(MosaicError::NoConnection {
                        source_node: self.node_id.clone(),
                        target,
                    });
                }
                // Open question 1: direct-target publish propagates the
                // upstream session id as the downstream id unconditionally,
                // bypassing SessionRouter. Preserved as-is.
                let envelope = Envelope::new(
                    &self.node_id,
                    &target,
                    event_type,
                    session_id,
                    session_id,
                    payload,
                );
                self.client
                    .send(crate::event::topic(&self.mesh_id, &target), envelope)
                    .await
            }
            None => {
                let subs = self
                    .store
                    .subscriptions_from(&self.mesh_id, &self.node_id, event_type)
                    .await;
                for sub in subs {
                    let conn = self
                        .store
                        .get_connection(&self.mesh_id, &self.node_id, &sub.target_node_id)
                        .await;
                    let align = conn.map(|c| c.session_alignment).unwrap_or_default();
                    let downstream_session_id = self
                        .session_router
                        .resolve(&self.mesh_id, &self.node_id, session_id, &sub.target_node_id, align)
                        .await;
                    let envelope = Envelope::new(
                        &self.node_id,
                        &sub.target_node_id,
                        event_type,
                        session_id,
                        downstream_session_id,
                        payload.clone(),
                    );
                    self.client
                        .send(crate::event::topic(&self.mesh_id, &sub.target_node_id), envelope)
                        .await?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::driver::ScriptedDriver;
    use crate::model::{Connection, InMemoryStore, Subscription};

    struct EchoDriverFactory;
    impl DriverFactory for EchoDriverFactory {
        fn build(&self) -> Box<dyn Driver> {
            Box::new(ScriptedDriver::echo("hi", 0.0))
        }
    }

    fn make_node(store: Arc<dyn ModelStore>, broker: Arc<Broker>, node_id: &str) -> Arc<Node> {
        Node::new(
            node_id.to_string(),
            "1".to_string(),
            "u1".to_string(),
            "agent",
            serde_json::json!({}),
            broker,
            store.clone(),
            Arc::new(UserBroker::new()),
            Arc::new(SystemPromptBuilder::new(store.clone())),
            Arc::new(SessionRouter::new(store)),
            Arc::new(EchoDriverFactory),
        )
    }

    #[tokio::test]
    async fn unknown_target_envelope_is_dropped() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        let broker = Broker::new(None);
        broker.start();
        let node = make_node(store, broker, "20");
        node.start().await.unwrap();

        let envelope = Envelope::new("10", "99", EventType::NodeMessage, "S1", "S2", serde_json::json!({}));
        node.on_envelope(envelope).await;
        assert!(node.get_session("S2").await.is_none());
    }

    #[tokio::test]
    async fn auto_creates_downstream_session_on_first_envelope() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        let broker = Broker::new(None);
        broker.start();
        let node = make_node(store.clone(), broker, "20");
        node.start().await.unwrap();
        store
            .insert_connection(Connection {
                mesh_id: "1".to_string(),
                source_node_id: "10".to_string(),
                target_node_id: "20".to_string(),
                session_alignment: SessionAlignment::Mirroring,
            })
            .await;

        let envelope = Envelope::new("10", "20", EventType::NodeMessage, "S1", "S2", serde_json::json!({"message": "hi"}));
        node.on_envelope(envelope).await;
        assert!(node.get_session("S2").await.is_some());
    }

    #[tokio::test]
    async fn tasking_connection_closes_session_after_processing() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        let broker = Broker::new(None);
        broker.start();
        let node = make_node(store.clone(), broker, "20");
        node.start().await.unwrap();
        store
            .insert_connection(Connection {
                mesh_id: "1".to_string(),
                source_node_id: "10".to_string(),
                target_node_id: "20".to_string(),
                session_alignment: SessionAlignment::Tasking,
            })
            .await;

        let envelope = Envelope::new("10", "20", EventType::NodeMessage, "S1", "S2", serde_json::json!({"message": "hi"}));
        node.on_envelope(envelope).await;
        assert!(node.get_session("S2").await.is_none());
    }

    #[tokio::test]
    async fn publish_with_zero_subscribers_is_noop_success() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        let broker = Broker::new(None);
        broker.start();
        let node = make_node(store, broker, "10");
        node.start().await.unwrap();
        let result = node
            .publish_event("S1", EventType::NodeMessage, serde_json::json!({"message": "hi"}), None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn publish_pub_sub_creates_routing_pair() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        let broker = Broker::new(None);
        broker.start();
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
        let n1 = make_node(store.clone(), broker.clone(), "10");
        let n2 = make_node(store.clone(), broker, "20");
        n1.start().await.unwrap();
        n2.start().await.unwrap();

        n1.publish_event("S1", EventType::NodeMessage, serde_json::json!({"message": "hi"}), None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let remote = store.routing_lookup("1", "10", "S1", "20").await;
        assert!(remote.is_some());
        assert!(n2.get_session(&remote.unwrap()).await.is_some());
    }
}
