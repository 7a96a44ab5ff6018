//! L5: per-mesh runtime owning its nodes and a command queue consumed
//! strictly in submission order by its own scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::broker::Broker;
use crate::error::MosaicError;
use crate::model::ModelStore;
use crate::node::{DriverFactory, Node};
use crate::session_router::SessionRouter;
use crate::system_prompt::SystemPromptBuilder;
use crate::user_broker::UserBroker;

pub type CommandCallback = oneshot::Sender<Result<(), MosaicError>>;

/// The 7 command types a MeshInstance's queue accepts (§4.5).
pub enum Command {
    CreateSession {
        node_id: String,
        session_id: String,
        callback: Option<CommandCallback>,
    },
    CloseSession {
        session_id: String,
        force: bool,
        callback: Option<CommandCallback>,
    },
    SendMessage {
        session_id: String,
        text: String,
        callback: Option<CommandCallback>,
    },
    InterruptSession {
        session_id: String,
        callback: Option<CommandCallback>,
    },
    StartNode {
        node_id: String,
        callback: Option<CommandCallback>,
    },
    StopNode {
        node_id: String,
        callback: Option<CommandCallback>,
    },
    RestartNode {
        node_id: String,
        callback: Option<CommandCallback>,
    },
}

fn reply(callback: Option<CommandCallback>, result: Result<(), MosaicError>) {
    if let Some(cb) = callback {
        let _ = cb.send(result);
    }
}

pub struct MeshInstance {
    pub mesh_id: String,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    session_node_map: RwLock<HashMap<String, String>>,
    tx: mpsc::UnboundedSender<Command>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    running: AtomicBool,
    store: Arc<dyn ModelStore>,
    broker: Arc<Broker>,
    user_broker: Arc<UserBroker>,
    system_prompt_builder: Arc<SystemPromptBuilder>,
    session_router: Arc<SessionRouter>,
    driver_factory: Arc<dyn DriverFactory>,
}

impl MeshInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mesh_id: String,
        store: Arc<dyn ModelStore>,
        broker: Arc<Broker>,
        user_broker: Arc<UserBroker>,
        system_prompt_builder: Arc<SystemPromptBuilder>,
        session_router: Arc<SessionRouter>,
        driver_factory: Arc<dyn DriverFactory>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            mesh_id,
            nodes: RwLock::new(HashMap::new()),
            session_node_map: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            running: AtomicBool::new(false),
            store,
            broker,
            user_broker,
            system_prompt_builder,
            session_router,
            driver_factory,
        })
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.tx.clone()
    }

    /// Launch the command consumer and auto-start every persisted node
    /// flagged `auto_start`.
    #[instrument(skip(self), fields(mesh_id = %self.mesh_id))]
    pub async fn start(self: &Arc<Self>) -> Result<(), MosaicError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MosaicError::AlreadyStarted(self.mesh_id.clone()));
        }
        let Some(rx) = self.rx.lock().await.take() else {
            return Ok(());
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_consumer(rx).await;
        });

        for node in self.store.list_nodes(&self.mesh_id).await {
            if node.auto_start
                && let Err(e) = self.start_node(&node.node_id).await {
                    warn!(error = %e, node_id = %node.node_id, "auto-start failed");
                }
        }
        info!(mesh_id = %self.mesh_id, "mesh started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), MosaicError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(MosaicError::MeshNotRunning(self.mesh_id.clone()));
        }
        let node_ids: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        for node_id in node_ids {
            if let Some(node) = self.nodes.write().await.remove(&node_id) {
                let _ = node.stop().await;
            }
        }
        Ok(())
    }

    async fn run_consumer(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.process_command(command).await;
        }
    }

    async fn process_command(&self, command: Command) {
        match command {
            Command::CreateSession {
                node_id,
                session_id,
                callback,
            } => {
                let result = self
                    .with_node(&node_id, |node| {
                        let session_id = session_id.clone();
                        async move { node.create_session(&session_id).await.map(|_| ()) }
                    })
                    .await;
                if result.is_ok() {
                    self.session_node_map
                        .write()
                        .await
                        .insert(session_id.clone(), node_id.clone());
                }
                reply(callback, result);
            }
            Command::CloseSession {
                session_id,
                force,
                callback,
            } => {
                let result = self
                    .with_owning_node(&session_id, |node, session_id| async move {
                        node.close_session(&session_id, force).await
                    })
                    .await;
                if result.is_ok() {
                    self.session_node_map.write().await.remove(&session_id);
                }
                reply(callback, result);
            }
            Command::SendMessage {
                session_id,
                text,
                callback,
            } => {
                let result = self
                    .with_owning_node(&session_id, |node, session_id| async move {
                        let session = node
                            .get_session(&session_id)
                            .await
                            .ok_or_else(|| MosaicError::SessionNotFound(session_id.clone()))?;
                        session.send_user_message(text).await
                    })
                    .await;
                reply(callback, result);
            }
            Command::InterruptSession { session_id, callback } => {
                let result = self
                    .with_owning_node(&session_id, |node, session_id| async move {
                        let session = node
                            .get_session(&session_id)
                            .await
                            .ok_or_else(|| MosaicError::SessionNotFound(session_id.clone()))?;
                        session.interrupt().await
                    })
                    .await;
                reply(callback, result);
            }
            Command::StartNode { node_id, callback } => {
                let result = self.start_node(&node_id).await;
                reply(callback, result);
            }
            Command::StopNode { node_id, callback } => {
                let result = self.stop_node(&node_id).await;
                reply(callback, result);
            }
            Command::RestartNode { node_id, callback } => {
                let result = match self.stop_node(&node_id).await {
                    Ok(()) => self.start_node(&node_id).await,
                    Err(e) => Err(e),
                };
                reply(callback, result);
            }
        }
    }

    async fn with_node<F, Fut>(&self, node_id: &str, f: F) -> Result<(), MosaicError>
    where
        F: FnOnce(Arc<Node>) -> Fut,
        Fut: std::future::Future<Output = Result<(), MosaicError>>,
    {
        let node = self
            .nodes
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| MosaicError::NodeNotFound(node_id.to_string()))?;
        f(node).await
    }

    /// Resolve `session_id` to its owning node via `session_node_map`
    /// before running `f`. This is the lookup §4.5 describes MeshInstance
    /// holding so later commands need not repeat the node id.
    async fn with_owning_node<F, Fut>(&self, session_id: &str, f: F) -> Result<(), MosaicError>
    where
        F: FnOnce(Arc<Node>, String) -> Fut,
        Fut: std::future::Future<Output = Result<(), MosaicError>>,
    {
        let node_id = self
            .session_node_map
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| MosaicError::SessionNotFound(session_id.to_string()))?;
        let node = self
            .nodes
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or(MosaicError::NodeNotFound(node_id))?;
        f(node, session_id.to_string()).await
    }

    pub async fn start_node(&self, node_id: &str) -> Result<(), MosaicError> {
        if self.nodes.read().await.contains_key(node_id) {
            return Err(MosaicError::NodeAlreadyRunning(node_id.to_string()));
        }
        let row = self
            .store
            .get_node(&self.mesh_id, node_id)
            .await
            .ok_or_else(|| MosaicError::NodeNotFound(node_id.to_string()))?;
        let node = Node::new(
            row.node_id.clone(),
            self.mesh_id.clone(),
            row.user_id.clone(),
            &row.node_type,
            row.config.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.store),
            Arc::clone(&self.user_broker),
            Arc::clone(&self.system_prompt_builder),
            Arc::clone(&self.session_router),
            Arc::clone(&self.driver_factory),
        );
        node.start().await?;
        self.nodes.write().await.insert(node_id.to_string(), node);
        Ok(())
    }

    pub async fn stop_node(&self, node_id: &str) -> Result<(), MosaicError> {
        let node = self
            .nodes
            .write()
            .await
            .remove(node_id)
            .ok_or_else(|| MosaicError::NodeNotFound(node_id.to_string()))?;
        node.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, ScriptedDriver};
    use crate::model::{InMemoryStore, Node as NodeRow};
    use serde_json::json;
    use std::path::PathBuf;

    struct EchoDriverFactory;
    impl DriverFactory for EchoDriverFactory {
        fn build(&self) -> Box<dyn Driver> {
            Box::new(ScriptedDriver::echo("hi", 0.0))
        }
    }

    fn make_mesh(store: Arc<dyn ModelStore>) -> Arc<MeshInstance> {
        let broker = Broker::new(None);
        broker.start();
        MeshInstance::new(
            "1".to_string(),
            store.clone(),
            broker,
            Arc::new(UserBroker::new()),
            Arc::new(SystemPromptBuilder::new(store.clone())),
            Arc::new(SessionRouter::new(store)),
            Arc::new(EchoDriverFactory),
        )
    }

    #[tokio::test]
    async fn start_node_then_create_session_via_command() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        store
            .insert_node(NodeRow {
                node_id: "10".to_string(),
                node_type: "agent".to_string(),
                mesh_id: "1".to_string(),
                user_id: "u1".to_string(),
                config: json!({}),
                workspace: PathBuf::from("/tmp"),
                auto_start: false,
            })
            .await;
        let mesh = make_mesh(store);
        mesh.start().await.unwrap();

        let (tx, rx) = oneshot::channel();
        mesh.sender()
            .send(Command::StartNode {
                node_id: "10".to_string(),
                callback: Some(tx),
            })
            .unwrap();
        assert!(rx.await.unwrap().is_ok());

        let (tx, rx) = oneshot::channel();
        mesh.sender()
            .send(Command::CreateSession {
                node_id: "10".to_string(),
                session_id: "s1".to_string(),
                callback: Some(tx),
            })
            .unwrap();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn start_node_twice_fails() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        store
            .insert_node(NodeRow {
                node_id: "10".to_string(),
                node_type: "agent".to_string(),
                mesh_id: "1".to_string(),
                user_id: "u1".to_string(),
                config: json!({}),
                workspace: PathBuf::from("/tmp"),
                auto_start: false,
            })
            .await;
        let mesh = make_mesh(store);
        mesh.start().await.unwrap();
        mesh.start_node("10").await.unwrap();
        assert!(matches!(
            mesh.start_node("10").await,
            Err(MosaicError::NodeAlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn send_message_routes_via_session_node_map_without_node_id() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        store
            .insert_node(NodeRow {
                node_id: "10".to_string(),
                node_type: "agent".to_string(),
                mesh_id: "1".to_string(),
                user_id: "u1".to_string(),
                config: json!({}),
                workspace: PathBuf::from("/tmp"),
                auto_start: false,
            })
            .await;
        let mesh = make_mesh(store);
        mesh.start().await.unwrap();
        mesh.start_node("10").await.unwrap();

        let (tx, rx) = oneshot::channel();
        mesh.sender()
            .send(Command::CreateSession {
                node_id: "10".to_string(),
                session_id: "s1".to_string(),
                callback: Some(tx),
            })
            .unwrap();
        rx.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        mesh.sender()
            .send(Command::SendMessage {
                session_id: "s1".to_string(),
                text: "hello".to_string(),
                callback: Some(tx),
            })
            .unwrap();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn send_message_to_unknown_session_fails() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        let mesh = make_mesh(store);
        mesh.start().await.unwrap();
        let (tx, rx) = oneshot::channel();
        mesh.sender()
            .send(Command::SendMessage {
                session_id: "ghost".to_string(),
                text: "hi".to_string(),
                callback: Some(tx),
            })
            .unwrap();
        assert!(matches!(rx.await.unwrap(), Err(MosaicError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn command_against_unknown_node_fails() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        let mesh = make_mesh(store);
        mesh.start().await.unwrap();
        let (tx, rx) = oneshot::channel();
        mesh.sender()
            .send(Command::StopNode {
                node_id: "ghost".to_string(),
                callback: Some(tx),
            })
            .unwrap();
        assert!(matches!(rx.await.unwrap(), Err(MosaicError::NodeNotFound(_))));
    }
}
