//! L3: the polymorphic Session abstraction. A Session is a stateful
//! interaction context inside a Node; concrete kinds are `AgentSession`
//! and `AggregatorSession`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::driver::{Driver, Fragment};
use crate::error::MosaicError;
use crate::event::{Envelope, EventPayload, EventType};
use crate::model::{MessageRole, ModelStore, SessionMode, SessionRecord, SessionStatus};
use crate::user_broker::{UserBroker, UserMessage};

/// Non-owning handle a Session uses to publish events and reach its
/// parent Node, per the redesign guidance against two-way references:
/// Node owns its Sessions outright; Sessions hold only this thin handle.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        session_id: &str,
        event_type: EventType,
        payload: Value,
        target_node_id: Option<String>,
    ) -> Result<(), MosaicError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    fn session_id(&self) -> &str;
    async fn start(&self) -> Result<(), MosaicError>;
    async fn close(&self, force: bool) -> Result<(), MosaicError>;
    async fn process_event(&self, envelope: Envelope) -> Result<(), MosaicError>;
    async fn send_user_message(&self, text: String) -> Result<(), MosaicError>;

    /// Request cancellation of the in-flight turn, if any. Only
    /// `AgentSession` has a turn to cancel; other kinds reject it.
    async fn interrupt(&self) -> Result<(), MosaicError> {
        Err(MosaicError::DriverFailed(
            "this session kind does not support interrupt".to_string(),
        ))
    }
}

fn user_message_type_for(fragment: &Fragment) -> &'static str {
    match fragment {
        Fragment::Text(_) => "assistant_text",
        Fragment::Thinking(_) => "assistant_thinking",
        Fragment::ToolUse(_) => "assistant_tool_use",
        Fragment::Result(_) => "assistant_result",
    }
}

fn fragment_content(fragment: &Fragment) -> Value {
    match fragment {
        Fragment::Text(t) => serde_json::json!({ "text": t }),
        Fragment::Thinking(t) => serde_json::json!({ "thinking": t }),
        Fragment::ToolUse(t) => serde_json::json!({ "name": t.name, "input": t.input }),
        Fragment::Result(r) => serde_json::json!({
            "text": r.text,
            "total_cost_usd": r.total_cost_usd,
            "usage": { "input_tokens": r.usage.input_tokens, "output_tokens": r.usage.output_tokens },
        }),
    }
}

pub struct AgentSession {
    session_id: String,
    user_id: String,
    mesh_id: String,
    node_id: String,
    mode: SessionMode,
    driver: RwLock<Box<dyn Driver>>,
    store: Arc<dyn ModelStore>,
    user_broker: Arc<UserBroker>,
    publisher: Arc<dyn EventPublisher>,
    system_prompt: Mutex<Option<String>>,
    interrupted: AtomicBool,
    closed: AtomicBool,
    /// Feeds the dedicated turn-loop task spawned by `start()`. `None`
    /// once `close()` has run, so no further turns can be enqueued.
    turn_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    turn_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    self_ref: OnceLock<Weak<AgentSession>>,
}

impl AgentSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        user_id: String,
        mesh_id: String,
        node_id: String,
        mode: SessionMode,
        driver: Box<dyn Driver>,
        store: Arc<dyn ModelStore>,
        user_broker: Arc<UserBroker>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            session_id,
            user_id,
            mesh_id,
            node_id,
            mode,
            driver: RwLock::new(driver),
            store,
            user_broker,
            publisher,
            system_prompt: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            turn_tx: Mutex::new(None),
            turn_task: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = session.self_ref.set(Arc::downgrade(&session));
        session
    }

    /// Set by the Node before `start()`, from `SystemPromptBuilder`.
    pub async fn set_system_prompt(&self, prompt: String) {
        *self.system_prompt.lock().await = Some(prompt);
    }

    /// `_emit`: the single outbound chokepoint (§4.3). Writes the Message
    /// row first; the UserBroker handoff only happens if that succeeds.
    async fn emit(&self, role: MessageRole, r#type: &str, content: Value) {
        let stored = self
            .store
            .append_message(&self.session_id, role, r#type, content.to_string())
            .await;
        let message = match stored {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, session_id = %self.session_id, "emit: message persistence failed, suppressing delivery");
                return;
            }
        };
        let _ = self.store.touch_activity(&self.session_id).await;

        let user_message = UserMessage {
            session_id: self.session_id.clone(),
            r#type: r#type.to_string(),
            role,
            content,
            message_id: message.message_id,
            sequence: message.sequence,
            timestamp: chrono::Utc::now(),
        };
        self.user_broker
            .push_from_worker(&self.user_id, user_message)
            .await;
    }

    /// One request/response turn of the agent loop (§4.3 steps 1-7).
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    async fn run_turn(&self, text: String) -> Result<(), MosaicError> {
        self.emit(
            MessageRole::User,
            "user_message",
            serde_json::json!({ "text": text }),
        )
        .await;

        if matches!(self.mode, SessionMode::Background) {
            let payload = EventPayload::UserPromptSubmit { prompt: text.clone() }.into_json();
            if let Err(e) = self
                .publisher
                .publish(&self.session_id, EventType::UserPromptSubmit, payload, None)
                .await
            {
                warn!(error = %e, "failed to publish user_prompt_submit");
            }
        }

        let mut driver = self.driver.write().await;
        driver.query(&text).await?;
        // Downgrade to a shared read lock before streaming: `interrupt()`
        // only ever needs a read lock too, so it can run concurrently
        // with this turn instead of queueing up behind it.
        let driver = driver.downgrade();

        let mut stream = driver.receive_response();
        use futures::StreamExt;
        let mut turn_result: Option<Fragment> = None;
        while let Some(item) = stream.next().await {
            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }
            let fragment = item?;
            let is_result = matches!(fragment, Fragment::Result(_));
            self.emit(
                MessageRole::Assistant,
                user_message_type_for(&fragment),
                fragment_content(&fragment),
            )
            .await;
            if is_result {
                turn_result = Some(fragment);
                break;
            }
        }
        drop(stream);
        drop(driver);

        if let Some(Fragment::Result(result)) = turn_result {
            self.store
                .record_turn_stats(
                    &self.session_id,
                    result.usage.input_tokens,
                    result.usage.output_tokens,
                    result.total_cost_usd,
                )
                .await?;

            if matches!(self.mode, SessionMode::Background) && !self.interrupted.load(Ordering::SeqCst) {
                let payload = EventPayload::SessionResponse {
                    response: result.text.clone(),
                }
                .into_json();
                if let Err(e) = self
                    .publisher
                    .publish(&self.session_id, EventType::SessionResponse, payload, None)
                    .await
                {
                    warn!(error = %e, "failed to publish session_response");
                }
            }
        }

        self.interrupted.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Session for AgentSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn start(&self) -> Result<(), MosaicError> {
        self.store
            .create_session(SessionRecord {
                session_id: self.session_id.clone(),
                user_id: self.user_id.clone(),
                mesh_id: self.mesh_id.clone(),
                node_id: self.node_id.clone(),
                mode: self.mode,
                status: SessionStatus::Active,
                stats: Default::default(),
            })
            .await;
        let system_prompt = self.system_prompt.lock().await.clone();
        self.driver.write().await.connect(system_prompt).await?;

        // Per-session turn loop (§9): a dedicated task drains queued user
        // turns one at a time, so `send_user_message` only has to enqueue
        // and return, leaving the mesh's command consumer free to process
        // an `InterruptSession` the moment it's submitted instead of
        // sitting behind an in-flight turn.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.turn_tx.lock().await = Some(tx);
        let weak = self.self_ref.get().cloned().unwrap_or_default();
        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let Some(session) = weak.upgrade() else { break };
                if let Err(e) = session.run_turn(text).await {
                    warn!(error = %e, "agent turn failed");
                }
            }
        });
        *self.turn_task.lock().await = Some(task);

        info!(session_id = %self.session_id, "agent session started");
        Ok(())
    }

    async fn close(&self, force: bool) -> Result<(), MosaicError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping our sender lets the loop task drain whatever turns are
        // already queued, then return `None` and exit on its own.
        self.turn_tx.lock().await.take();
        if let Some(task) = self.turn_task.lock().await.take() {
            if force {
                task.abort();
            } else {
                let _ = task.await;
            }
        }
        self.driver.write().await.disconnect().await?;
        self.store
            .update_session_status(&self.session_id, SessionStatus::Closed)
            .await?;
        if matches!(self.mode, SessionMode::Background) && !force {
            let _ = self
                .publisher
                .publish(&self.session_id, EventType::SessionEnd, serde_json::json!({}), None)
                .await;
        }
        Ok(())
    }

    async fn process_event(&self, envelope: Envelope) -> Result<(), MosaicError> {
        // event -> message: translate an inbound event to a user-facing
        // text and enqueue it onto the same turn loop a direct user
        // message would use.
        let text = envelope
            .payload
            .get("message")
            .or_else(|| envelope.payload.get("prompt"))
            .or_else(|| envelope.payload.get("response"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| envelope.payload.to_string());
        self.send_user_message(text).await
    }

    async fn send_user_message(&self, text: String) -> Result<(), MosaicError> {
        let guard = self.turn_tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| MosaicError::NotRunning(self.session_id.clone()))?;
        tx.send(text)
            .map_err(|_| MosaicError::DriverFailed("turn loop not running".to_string()))
    }

    /// Cooperative cancellation of the in-flight turn, if any (§4.3):
    /// asserts the flag and signals the Driver. Only ever needs a read
    /// lock on the driver, so it runs concurrently with a turn already
    /// streaming a response rather than queueing up behind it.
    async fn interrupt(&self) -> Result<(), MosaicError> {
        self.interrupted.store(true, Ordering::SeqCst);
        self.driver.read().await.interrupt().await
    }
}

/// Buffers inbound events and batch-publishes them on close. The target
/// for the batch is deliberately unspecified (§9 open question 2): the
/// original system computes the batch but never configures where it
/// goes, and this implementation preserves that as a best-effort,
/// non-functional send rather than inventing a target.
pub struct AggregatorSession {
    session_id: String,
    queue: Mutex<Vec<Envelope>>,
    closed: AtomicBool,
}

impl AggregatorSession {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            queue: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Session for AggregatorSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn start(&self) -> Result<(), MosaicError> {
        Ok(())
    }

    async fn close(&self, force: bool) -> Result<(), MosaicError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut queue = self.queue.lock().await;
        if !force && !queue.is_empty() {
            info!(
                session_id = %self.session_id,
                count = queue.len(),
                "aggregator session collected events on close (no configured target, not sent)"
            );
        }
        queue.clear();
        Ok(())
    }

    async fn process_event(&self, envelope: Envelope) -> Result<(), MosaicError> {
        self.queue.lock().await.push(envelope);
        Ok(())
    }

    async fn send_user_message(&self, _text: String) -> Result<(), MosaicError> {
        Err(MosaicError::DriverFailed(
            "aggregator sessions do not accept user messages".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InMemoryStore;

    struct NullPublisher;
    #[async_trait]
    impl EventPublisher for NullPublisher {
        async fn publish(
            &self,
            _session_id: &str,
            _event_type: EventType,
            _payload: Value,
            _target_node_id: Option<String>,
        ) -> Result<(), MosaicError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn aggregator_close_is_noop_even_with_queued_events() {
        let session = AggregatorSession::new("agg-1".to_string());
        let env = Envelope::new("10", "20", EventType::NodeMessage, "S1", "agg-1", serde_json::json!({}));
        session.process_event(env).await.unwrap();
        assert!(session.close(false).await.is_ok());
        // closing again is a no-op success
        assert!(session.close(true).await.is_ok());
    }

    #[tokio::test]
    async fn aggregator_rejects_user_messages() {
        let session = AggregatorSession::new("agg-1".to_string());
        assert!(session.send_user_message("hi".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn agent_session_runs_turn_and_persists_messages() {
        use crate::driver::ScriptedDriver;
        let store = Arc::new(InMemoryStore::new());
        let user_broker = Arc::new(UserBroker::new());
        let session = AgentSession::new(
            "s1".to_string(),
            "u1".to_string(),
            "1".to_string(),
            "10".to_string(),
            SessionMode::Chat,
            Box::new(ScriptedDriver::echo("hello back", 0.02)),
            store.clone(),
            user_broker,
            Arc::new(NullPublisher),
        );
        session.start().await.unwrap();
        session.send_user_message("hi".to_string()).await.unwrap();
        // send_user_message only enqueues; close(false) joins the turn
        // loop task, so the turn is guaranteed to have finished by here.
        session.close(false).await.unwrap();

        let record = store.get_session("s1").await.unwrap();
        assert_eq!(record.stats.message_count, 3); // user_message, assistant_text, assistant_result
        assert!(record.stats.total_cost_usd > 0.0);
    }

    /// A genuine mid-turn interrupt: the scripted driver is given a
    /// per-fragment delay, so the turn is still streaming when
    /// `interrupt()` is called. Proves both that the turn stops early
    /// and that `interrupt()` itself doesn't block behind the in-flight
    /// turn's driver lock (it must return well within the fragment
    /// delay, not after the whole script has played out).
    #[tokio::test]
    async fn interrupt_stops_turn_mid_flight_without_blocking() {
        use crate::driver::ScriptedDriver;
        let store = Arc::new(InMemoryStore::new());
        let user_broker = Arc::new(UserBroker::new());
        let driver = ScriptedDriver::echo("hello back", 0.02).with_delay(std::time::Duration::from_millis(200));
        let session = AgentSession::new(
            "s2".to_string(),
            "u1".to_string(),
            "1".to_string(),
            "10".to_string(),
            SessionMode::Background,
            Box::new(driver),
            store.clone(),
            user_broker,
            Arc::new(NullPublisher),
        );
        session.start().await.unwrap();
        session.send_user_message("hi".to_string()).await.unwrap();
        // Let the turn begin (first fragment not yet delivered) before
        // interrupting, so this is a mid-stream cancel, not a pre-send one.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        tokio::time::timeout(std::time::Duration::from_millis(100), session.interrupt())
            .await
            .expect("interrupt must not block behind the in-flight turn")
            .unwrap();

        session.close(false).await.unwrap();
        let record = store.get_session("s2").await.unwrap();
        // only the user_message echo should have been emitted; the
        // fragment stream was cut off before any assistant output
        assert_eq!(record.stats.message_count, 1);
    }
}
