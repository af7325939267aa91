//! Cross-instance relay
//!
//! Every process holds a disjoint set of connections. Events that must reach
//! connections on other processes are wrapped in an [`Envelope`] and published
//! on a per-user or per-conversation topic. Local subscribers register
//! handlers; the bridge keeps exactly one fleet-level subscription per topic
//! no matter how many local handlers share it, and drops envelopes that this
//! process published itself (local delivery already happened).

use crate::metrics;
use crate::websocket::message_types::ServerFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub mod memory;
pub mod redis;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identity of this running server instance, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let boot_ms = chrono::Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}:{}:{}:{}",
            host,
            std::process::id(),
            boot_ms,
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    User(Uuid),
    Conversation(Uuid),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::User(id) => write!(f, "user:{}", id),
            Topic::Conversation(id) => write!(f, "conv:{}", id),
        }
    }
}

/// Broker payload: the client-visible event plus routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: ProcessId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_user_id: Option<Uuid>,
    pub event: ServerFrame,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

pub type InboundSender = UnboundedSender<InboundMessage>;
pub type InboundReceiver = UnboundedReceiver<InboundMessage>;

/// Fleet-level pub/sub transport.
///
/// `subscribe`/`unsubscribe` only enqueue; the transport applies them in
/// call order. Inbound messages are pushed into the [`InboundSender`] the
/// transport was built with.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError>;

    fn subscribe(&self, topic: &str);

    fn unsubscribe(&self, topic: &str);
}

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Default)]
struct TopicEntry {
    handlers: Vec<(u64, Handler)>,
}

struct BridgeInner {
    process_id: ProcessId,
    transport: Arc<dyn BrokerTransport>,
    topics: Mutex<HashMap<String, TopicEntry>>,
    next_handler_id: AtomicU64,
}

#[derive(Clone)]
pub struct BrokerBridge {
    inner: Arc<BridgeInner>,
}

impl BrokerBridge {
    pub fn new(process_id: ProcessId, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                process_id,
                transport,
                topics: Mutex::new(HashMap::new()),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    /// Build the bridge and spawn the task that dispatches inbound messages.
    pub fn start(
        process_id: ProcessId,
        transport: Arc<dyn BrokerTransport>,
        mut inbound: InboundReceiver,
    ) -> (Self, JoinHandle<()>) {
        let bridge = Self::new(process_id, transport);
        let dispatcher = bridge.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                dispatcher.dispatch(message);
            }
            tracing::warn!("broker inbound channel closed, dispatcher stopping");
        });
        (bridge, handle)
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.inner.process_id
    }

    /// Fire-and-forget publish. Failures are logged and counted, never returned.
    pub async fn publish(&self, topic: Topic, event: ServerFrame, exclude_user_id: Option<Uuid>) {
        let envelope = Envelope {
            origin: self.inner.process_id.clone(),
            exclude_user_id,
            event,
        };
        let result = match serde_json::to_string(&envelope) {
            Ok(payload) => self.inner.transport.publish(&topic.to_string(), payload).await,
            Err(e) => Err(BrokerError::from(e)),
        };

        if let Err(e) = result {
            metrics::BROKER_PUBLISH_FAILURES.inc();
            tracing::warn!(
                topic = %topic,
                kind = envelope.event.kind(),
                error = %e,
                "broker publish failed, remote delivery skipped"
            );
        }
    }

    /// Register a handler for `topic`. The first local handler opens the
    /// fleet-level subscription; the returned handle releases this handler.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let key = topic.to_string();
        {
            let mut topics = self
                .inner
                .topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let entry = topics.entry(key.clone()).or_default();
            if entry.handlers.is_empty() {
                // Enqueued under the lock so subscribe/unsubscribe reach the
                // transport in the same order as the refcount changes.
                self.inner.transport.subscribe(&key);
                metrics::BROKER_TOPICS.inc();
                tracing::debug!(topic = %key, "opened fleet subscription");
            }
            entry.handlers.push((id, Arc::new(handler)));
        }

        Subscription {
            bridge: self.inner.clone(),
            topic,
            id,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Number of local handlers registered for `topic`.
    pub fn local_subscribers(&self, topic: Topic) -> usize {
        let topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        topics
            .get(&topic.to_string())
            .map(|e| e.handlers.len())
            .unwrap_or(0)
    }

    pub(crate) fn dispatch(&self, message: InboundMessage) {
        let envelope: Envelope = match serde_json::from_str(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "dropping malformed envelope");
                return;
            }
        };

        if envelope.origin == self.inner.process_id {
            metrics::BROKER_SELF_ECHO_DROPPED.inc();
            return;
        }

        let handlers: Vec<Handler> = {
            let topics = self
                .inner
                .topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match topics.get(&message.topic) {
                Some(entry) => entry.handlers.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };

        for handler in handlers {
            handler(&envelope);
        }
    }
}

/// Cancellation handle returned by [`BrokerBridge::subscribe`].
///
/// Cancelling is idempotent; dropping the handle cancels it.
pub struct Subscription {
    bridge: Arc<BridgeInner>,
    topic: Topic,
    id: u64,
    cancelled: AtomicBool,
}

impl Subscription {
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let key = self.topic.to_string();
        let mut topics = self
            .bridge
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = topics.get_mut(&key) {
            entry.handlers.retain(|(id, _)| *id != self.id);
            if entry.handlers.is_empty() {
                topics.remove(&key);
                self.bridge.transport.unsubscribe(&key);
                metrics::BROKER_TOPICS.dec();
                tracing::debug!(topic = %key, "released fleet subscription");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}
