//! L1: single-process in-memory pub/sub, and L2: the per-node handle
//! over it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::error::MosaicError;
use crate::event::Envelope;

pub type EnvelopeCallback =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Optional write-behind side effect, invoked after a successful
/// distribution (§4.1). Failure to persist never fails the delivery.
pub trait EventLogSink: Send + Sync {
    fn record(&self, target_user_id: Option<&str>, envelope: &Envelope);
}

pub type SubscriptionHandle = u64;

struct Subscriber {
    handle: SubscriptionHandle,
    callback: EnvelopeCallback,
}

/// In-process broker. Envelopes enqueued by the same caller on the same
/// topic are delivered in enqueue order to each subscriber of that topic;
/// no ordering is guaranteed across topics or publishers.
pub struct Broker {
    running: AtomicBool,
    tx: mpsc::UnboundedSender<(String, Envelope)>,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<(String, Envelope)>>>,
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_handle: AtomicU64,
    event_log: Option<Arc<dyn EventLogSink>>,
}

impl Broker {
    pub fn new(event_log: Option<Arc<dyn EventLogSink>>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            running: AtomicBool::new(false),
            tx,
            rx: tokio::sync::Mutex::new(Some(rx)),
            subscribers: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            event_log,
        })
    }

    /// Start the distribution loop. Safe to call once; subsequent calls
    /// are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut rx) = self.rx.try_lock().ok().and_then(|mut g| g.take()) else {
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((topic, envelope)) = rx.recv().await {
                this.distribute(topic, envelope).await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enqueue an envelope for distribution. Fails with `BrokerStopped`
    /// if the broker has not been started.
    pub fn publish(&self, topic: String, envelope: Envelope) -> Result<(), MosaicError> {
        if !self.is_running() {
            return Err(MosaicError::BrokerStopped);
        }
        self.tx
            .send((topic, envelope))
            .map_err(|_| MosaicError::BrokerStopped)
    }

    /// Register a callback for a topic. Delivery is best-effort: each
    /// subscriber's callback runs as an independent task so a slow
    /// consumer never blocks another.
    pub async fn subscribe(&self, topic: String, callback: EnvelopeCallback) -> SubscriptionHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .write()
            .await
            .entry(topic)
            .or_default()
            .push(Subscriber { handle, callback });
        handle
    }

    /// In-flight deliveries already dispatched to this subscriber may
    /// still complete after this returns.
    pub async fn unsubscribe(&self, topic: &str, handle: SubscriptionHandle) {
        if let Some(subs) = self.subscribers.write().await.get_mut(topic) {
            subs.retain(|s| s.handle != handle);
        }
    }

    async fn distribute(&self, topic: String, envelope: Envelope) {
        let subs = self.subscribers.read().await;
        let Some(subscribers) = subs.get(&topic) else {
            debug!(topic = %topic, "no subscribers for topic");
            return;
        };
        for sub in subscribers {
            let callback = Arc::clone(&sub.callback);
            let envelope = envelope.clone();
            let topic_for_log = topic.clone();
            tokio::spawn(async move {
                callback(envelope).await;
                debug!(topic = %topic_for_log, "envelope delivered");
            });
        }
        drop(subs);

        if let Some(sink) = &self.event_log {
            let sink = Arc::clone(sink);
            let envelope = envelope.clone();
            tokio::task::spawn_blocking(move || {
                sink.record(None, &envelope);
            });
        }
    }
}

/// Thin per-node handle over the Broker. Owns no queues of its own.
pub struct Client {
    broker: Arc<Broker>,
    mesh_id: String,
    node_id: String,
    handle: tokio::sync::Mutex<Option<SubscriptionHandle>>,
}

impl Client {
    pub fn new(broker: Arc<Broker>, mesh_id: String, node_id: String) -> Self {
        Self {
            broker,
            mesh_id,
            node_id,
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn topic(&self) -> String {
        crate::event::topic(&self.mesh_id, &self.node_id)
    }

    pub async fn connect(&self, on_envelope: EnvelopeCallback) {
        let handle = self.broker.subscribe(self.topic(), on_envelope).await;
        *self.handle.lock().await = Some(handle);
    }

    pub async fn disconnect(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            self.broker.unsubscribe(&self.topic(), handle).await;
        }
    }

    pub async fn send(&self, target_topic: String, envelope: Envelope) -> Result<(), MosaicError> {
        match self.broker.publish(target_topic, envelope) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "failed to publish envelope");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Envelope, EventType};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration};

    fn mk_envelope() -> Envelope {
        Envelope::new("10", "20", EventType::NodeMessage, "S1", "S2", serde_json::json!({}))
    }

    #[tokio::test]
    async fn publish_without_start_fails() {
        let broker = Broker::new(None);
        let err = broker.publish("1#20".into(), mk_envelope());
        assert!(matches!(err, Err(MosaicError::BrokerStopped)));
    }

    #[tokio::test]
    async fn subscriber_receives_published_envelope() {
        let broker = Broker::new(None);
        broker.start();
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);
        let cb: EnvelopeCallback = Arc::new(move |_env| {
            let received = Arc::clone(&received_clone);
            Box::pin(async move {
                received.fetch_add(1, Ordering::SeqCst);
            })
        });
        broker.subscribe("1#20".into(), cb).await;
        broker.publish("1#20".into(), mk_envelope()).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn topic_isolation_across_meshes() {
        let broker = Broker::new(None);
        broker.start();
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);
        let cb: EnvelopeCallback = Arc::new(move |_env| {
            let received = Arc::clone(&received_clone);
            Box::pin(async move {
                received.fetch_add(1, Ordering::SeqCst);
            })
        });
        broker.subscribe("2#20".into(), cb).await;
        broker.publish("1#20".into(), mk_envelope()).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_deliveries() {
        let broker = Broker::new(None);
        broker.start();
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);
        let cb: EnvelopeCallback = Arc::new(move |_env| {
            let received = Arc::clone(&received_clone);
            Box::pin(async move {
                received.fetch_add(1, Ordering::SeqCst);
            })
        });
        let handle = broker.subscribe("1#20".into(), cb).await;
        broker.unsubscribe("1#20", handle).await;
        broker.publish("1#20".into(), mk_envelope()).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }
}
