//! L6: process-wide singleton. Owns the Broker, the worker scheduler
//! pool, mesh placement, and the thread-safe command submission surface
//! called from the control-plane scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{oneshot, RwLock};
use tracing::{info, instrument};

use crate::broker::Broker;
use crate::error::MosaicError;
use crate::mesh_instance::{Command, MeshInstance};
use crate::model::ModelStore;
use crate::node::DriverFactory;
use crate::session_router::SessionRouter;
use crate::system_prompt::SystemPromptBuilder;
use crate::user_broker::UserBroker;

/// A dedicated OS thread running its own single-threaded tokio runtime:
/// the "worker scheduler" of §5. Every MeshInstance placed on this
/// worker spawns its command consumer and node tasks onto `handle`.
struct Worker {
    handle: tokio::runtime::Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize) -> Self {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name(format!("mosaic-worker-{id}"))
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("build worker runtime");
                let _ = handle_tx.send(rt.handle().clone());
                rt.block_on(async move {
                    let _ = shutdown_rx.await;
                });
            })
            .expect("spawn worker thread");
        let handle = handle_rx.recv().expect("receive worker runtime handle");
        Self {
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct RuntimeManager {
    broker: Arc<Broker>,
    workers: Vec<Worker>,
    meshes: RwLock<HashMap<String, (Arc<MeshInstance>, usize)>>,
    session_mesh_map: RwLock<HashMap<String, String>>,
    next_worker: AtomicUsize,
    store: Arc<dyn ModelStore>,
    user_broker: Arc<UserBroker>,
    system_prompt_builder: Arc<SystemPromptBuilder>,
    session_router: Arc<SessionRouter>,
    driver_factory: Arc<dyn DriverFactory>,
}

impl RuntimeManager {
    pub fn start(
        worker_count: usize,
        store: Arc<dyn ModelStore>,
        driver_factory: Arc<dyn DriverFactory>,
    ) -> Arc<Self> {
        let broker = Broker::new(None);
        broker.start();
        let workers = (0..worker_count.max(1)).map(Worker::spawn).collect();
        info!(worker_count, "runtime manager started");
        Arc::new(Self {
            broker,
            workers,
            meshes: RwLock::new(HashMap::new()),
            session_mesh_map: RwLock::new(HashMap::new()),
            next_worker: AtomicUsize::new(0),
            user_broker: Arc::new(UserBroker::new()),
            system_prompt_builder: Arc::new(SystemPromptBuilder::new(Arc::clone(&store))),
            session_router: Arc::new(SessionRouter::new(Arc::clone(&store))),
            store,
            driver_factory,
        })
    }

    pub fn user_broker(&self) -> Arc<UserBroker> {
        Arc::clone(&self.user_broker)
    }

    pub async fn stop(&mut self) {
        let mesh_ids: Vec<String> = self.meshes.read().await.keys().cloned().collect();
        for mesh_id in mesh_ids {
            if let Some((mesh, _)) = self.meshes.write().await.remove(&mesh_id) {
                let _ = mesh.stop().await;
            }
        }
        for worker in &mut self.workers {
            worker.stop();
        }
        self.broker.stop();
    }

    /// Round-robin placement at mesh-start time (§4.6).
    #[instrument(skip(self))]
    pub async fn start_mesh(&self, mesh_id: &str) -> Result<(), MosaicError> {
        if self.meshes.read().await.contains_key(mesh_id) {
            return Err(MosaicError::AlreadyStarted(mesh_id.to_string()));
        }
        let worker_idx = self.next_worker.fetch_add(1, Ordering::SeqCst) % self.workers.len();
        let worker = &self.workers[worker_idx];

        let mesh = MeshInstance::new(
            mesh_id.to_string(),
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            Arc::clone(&self.user_broker),
            Arc::clone(&self.system_prompt_builder),
            Arc::clone(&self.session_router),
            Arc::clone(&self.driver_factory),
        );
        let started = {
            let mesh = Arc::clone(&mesh);
            worker
                .handle
                .spawn(async move { mesh.start().await })
                .await
                .map_err(|e| MosaicError::DriverFailed(e.to_string()))?
        };
        started?;

        self.meshes
            .write()
            .await
            .insert(mesh_id.to_string(), (mesh, worker_idx));
        Ok(())
    }

    pub async fn stop_mesh(&self, mesh_id: &str) -> Result<(), MosaicError> {
        let (mesh, _) = self
            .meshes
            .write()
            .await
            .remove(mesh_id)
            .ok_or_else(|| MosaicError::MeshNotRunning(mesh_id.to_string()))?;
        mesh.stop().await
    }

    pub async fn register_session(&self, session_id: &str, mesh_id: &str) {
        self.session_mesh_map
            .write()
            .await
            .insert(session_id.to_string(), mesh_id.to_string());
    }

    pub async fn unregister_session(&self, session_id: &str) {
        self.session_mesh_map.write().await.remove(session_id);
    }

    async fn resolve_mesh(
        &self,
        mesh_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Arc<MeshInstance>, MosaicError> {
        let resolved = match mesh_id {
            Some(id) => id.to_string(),
            None => {
                let session_id = session_id.ok_or_else(|| {
                    MosaicError::SessionNotFound("no mesh_id or session_id given".to_string())
                })?;
                self.session_mesh_map
                    .read()
                    .await
                    .get(session_id)
                    .cloned()
                    .ok_or_else(|| MosaicError::SessionNotFound(session_id.to_string()))?
            }
        };
        self.meshes
            .read()
            .await
            .get(&resolved)
            .map(|(m, _)| Arc::clone(m))
            .ok_or(MosaicError::MeshNotRunning(resolved))
    }

    async fn submit(&self, mesh: Arc<MeshInstance>, command: Command, rx: oneshot::Receiver<Result<(), MosaicError>>) -> Result<(), MosaicError> {
        mesh.sender()
            .send(command)
            .map_err(|_| MosaicError::MeshNotRunning(mesh.mesh_id.clone()))?;
        rx.await
            .map_err(|_| MosaicError::DriverFailed("command callback dropped".to_string()))?
    }

    pub async fn submit_create_session(
        &self,
        mesh_id: &str,
        node_id: &str,
        session_id: &str,
    ) -> Result<(), MosaicError> {
        let mesh = self.resolve_mesh(Some(mesh_id), None).await?;
        let (tx, rx) = oneshot::channel();
        self.submit(
            Arc::clone(&mesh),
            Command::CreateSession {
                node_id: node_id.to_string(),
                session_id: session_id.to_string(),
                callback: Some(tx),
            },
            rx,
        )
        .await?;
        self.register_session(session_id, mesh_id).await;
        Ok(())
    }

    pub async fn submit_close_session(&self, session_id: &str, force: bool) -> Result<(), MosaicError> {
        let mesh = self.resolve_mesh(None, Some(session_id)).await?;
        let (tx, rx) = oneshot::channel();
        self.submit(
            mesh,
            Command::CloseSession {
                session_id: session_id.to_string(),
                force,
                callback: Some(tx),
            },
            rx,
        )
        .await?;
        self.unregister_session(session_id).await;
        Ok(())
    }

    pub async fn submit_send_message(&self, session_id: &str, text: String) -> Result<(), MosaicError> {
        let mesh = self.resolve_mesh(None, Some(session_id)).await?;
        let (tx, rx) = oneshot::channel();
        self.submit(
            mesh,
            Command::SendMessage {
                session_id: session_id.to_string(),
                text,
                callback: Some(tx),
            },
            rx,
        )
        .await
    }

    pub async fn submit_interrupt_session(&self, session_id: &str) -> Result<(), MosaicError> {
        let mesh = self.resolve_mesh(None, Some(session_id)).await?;
        let (tx, rx) = oneshot::channel();
        self.submit(
            mesh,
            Command::InterruptSession {
                session_id: session_id.to_string(),
                callback: Some(tx),
            },
            rx,
        )
        .await
    }

    pub async fn submit_start_node(&self, mesh_id: &str, node_id: &str) -> Result<(), MosaicError> {
        let mesh = self.resolve_mesh(Some(mesh_id), None).await?;
        let (tx, rx) = oneshot::channel();
        self.submit(
            mesh,
            Command::StartNode {
                node_id: node_id.to_string(),
                callback: Some(tx),
            },
            rx,
        )
        .await
    }

    pub async fn submit_stop_node(&self, mesh_id: &str, node_id: &str) -> Result<(), MosaicError> {
        let mesh = self.resolve_mesh(Some(mesh_id), None).await?;
        let (tx, rx) = oneshot::channel();
        self.submit(
            mesh,
            Command::StopNode {
                node_id: node_id.to_string(),
                callback: Some(tx),
            },
            rx,
        )
        .await
    }

    pub async fn submit_restart_node(&self, mesh_id: &str, node_id: &str) -> Result<(), MosaicError> {
        let mesh = self.resolve_mesh(Some(mesh_id), None).await?;
        let (tx, rx) = oneshot::channel();
        self.submit(
            mesh,
            Command::RestartNode {
                node_id: node_id.to_string(),
                callback: Some(tx),
            },
            rx,
        )
        .await
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

    #[tokio::test]
    async fn start_mesh_twice_fails() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        let rm = RuntimeManager::start(2, store, Arc::new(EchoDriverFactory));
        rm.start_mesh("1").await.unwrap();
        assert!(matches!(
            rm.start_mesh("1").await,
            Err(MosaicError::AlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn submit_create_session_registers_session_mesh_map() {
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
        let rm = RuntimeManager::start(2, store, Arc::new(EchoDriverFactory));
        rm.start_mesh("1").await.unwrap();
        rm.submit_start_node("1", "10").await.unwrap();
        rm.submit_create_session("1", "10", "s1").await.unwrap();

        rm.submit_send_message("s1", "hi".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn submit_without_mesh_id_or_known_session_fails() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
        let rm = RuntimeManager::start(1, store, Arc::new(EchoDriverFactory));
        assert!(rm.submit_send_message("ghost", "hi".to_string()).await.is_err());
    }
}
