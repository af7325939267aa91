use crate::broker::{BrokerBridge, Envelope, Subscription, Topic};
use crate::metrics;
use crate::services::directory::Identity;
use self::message_types::ServerFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

pub mod message_types;
pub mod session;
pub mod typing;

/// Unique identifier for one live WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Items on a connection's send queue. `Close` is queued behind any frame
/// already waiting, so an error frame reaches the client before the socket
/// is shut.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Close,
}

#[derive(Default)]
struct ConnectionSubscriptions {
    user: Option<Subscription>,
    conversation: Option<Subscription>,
}

/// One live transport session, owned by the process that accepted it.
///
/// All writes go through a single unbounded queue drained by the transport,
/// which serializes concurrent broadcasts to the same socket.
pub struct Connection {
    id: ConnectionId,
    sender: UnboundedSender<Outbound>,
    identity: OnceLock<Identity>,
    conversation: Mutex<Option<Uuid>>,
    alive: AtomicBool,
    closing: AtomicBool,
    subscriptions: Mutex<ConnectionSubscriptions>,
}

impl Connection {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<Outbound>) {
        let (sender, rx) = unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            sender,
            identity: OnceLock::new(),
            conversation: Mutex::new(None),
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            subscriptions: Mutex::new(ConnectionSubscriptions::default()),
        });
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.identity.get().map(|i| i.user_id)
    }

    /// Bind the authenticated owner. Returns `false` if one is already bound.
    pub fn bind_identity(&self, identity: Identity) -> bool {
        self.identity.set(identity).is_ok()
    }

    pub fn conversation(&self) -> Option<Uuid> {
        *self
            .conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Queue a reply produced by this connection's own session.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.deliver(frame, "direct")
    }

    fn deliver(&self, frame: ServerFrame, source: &'static str) -> bool {
        if !self.is_open() {
            return false;
        }
        let kind = frame.kind();
        if self.sender.send(Outbound::Frame(frame)).is_err() {
            return false;
        }
        metrics::FRAMES_DELIVERED
            .with_label_values(&[kind, source])
            .inc();
        true
    }

    /// Apply the envelope's exclusion and deliver its event.
    fn deliver_envelope(&self, envelope: &Envelope) {
        if envelope.exclude_user_id.is_some() && envelope.exclude_user_id == self.user_id() {
            return;
        }
        self.deliver(envelope.event.clone(), "broker");
    }

    /// Ask the transport to shut the socket once queued frames are written.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(Outbound::Close);
        }
    }

    /// Liveness acknowledgment from the client.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Read and reset the liveness flag for one heartbeat interval.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    fn with_subscriptions<T>(&self, f: impl FnOnce(&mut ConnectionSubscriptions) -> T) -> T {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut subs)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("conversation", &self.conversation())
            .finish()
    }
}

type ConnectionSet = HashMap<ConnectionId, Arc<Connection>>;

#[derive(Default)]
struct Indexes {
    by_user: HashMap<Uuid, ConnectionSet>,
    by_conversation: HashMap<Uuid, ConnectionSet>,
}

/// Per-process bookkeeping of live connections
///
/// The only owner of the user and conversation indexes. Broadcasts deliver
/// to local connections first and then publish to the broker; remote
/// processes re-deliver through their own registry.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Indexes>>,
    broker: BrokerBridge,
}

fn subscribe_for(broker: &BrokerBridge, topic: Topic, conn: &Arc<Connection>) -> Subscription {
    let weak: Weak<Connection> = Arc::downgrade(conn);
    broker.subscribe(topic, move |envelope| {
        if let Some(conn) = weak.upgrade() {
            conn.deliver_envelope(envelope);
        }
    })
}

impl ConnectionRegistry {
    pub fn new(broker: BrokerBridge) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Indexes::default())),
            broker,
        }
    }

    pub fn broker(&self) -> &BrokerBridge {
        &self.broker
    }

    /// Index an authenticated connection under its user and subscribe it to
    /// the user's topic. Returns the user's local connection count.
    pub async fn add_connection(&self, conn: &Arc<Connection>) -> usize {
        let Some(user_id) = conn.user_id() else {
            tracing::warn!(connection = ?conn.id(), "refusing to index unauthenticated connection");
            return 0;
        };

        let local = {
            let mut guard = self.inner.write().await;
            let set = guard.by_user.entry(user_id).or_default();
            if set.insert(conn.id(), conn.clone()).is_none() {
                metrics::ACTIVE_CONNECTIONS.inc();
            }
            set.len()
        };

        let sub = subscribe_for(&self.broker, Topic::User(user_id), conn);
        conn.with_subscriptions(|subs| subs.user = Some(sub));

        tracing::debug!(%user_id, connection = ?conn.id(), local, "connection registered");
        local
    }

    /// Drop a connection from every index and release all of its broker
    /// subscriptions. Returns the user's remaining local connection count.
    pub async fn remove_connection(&self, conn: &Arc<Connection>) -> usize {
        self.leave_conversation(conn).await;

        let Some(user_id) = conn.user_id() else {
            return 0;
        };

        let remaining = {
            let mut guard = self.inner.write().await;
            match guard.by_user.get_mut(&user_id) {
                Some(set) => {
                    if set.remove(&conn.id()).is_some() {
                        metrics::ACTIVE_CONNECTIONS.dec();
                    }
                    let remaining = set.len();
                    if remaining == 0 {
                        guard.by_user.remove(&user_id);
                    }
                    remaining
                }
                None => 0,
            }
        };

        if let Some(sub) = conn.with_subscriptions(|subs| subs.user.take()) {
            sub.cancel();
        }

        tracing::debug!(%user_id, connection = ?conn.id(), remaining, "connection removed");
        remaining
    }

    /// Join `conversation_id`, leaving any previous conversation first.
    pub async fn join_conversation(&self, conn: &Arc<Connection>, conversation_id: Uuid) {
        if conn.conversation() == Some(conversation_id) {
            return;
        }
        self.leave_conversation(conn).await;

        {
            let mut guard = self.inner.write().await;
            guard
                .by_conversation
                .entry(conversation_id)
                .or_default()
                .insert(conn.id(), conn.clone());
        }
        *conn
            .conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(conversation_id);

        let sub = subscribe_for(&self.broker, Topic::Conversation(conversation_id), conn);
        conn.with_subscriptions(|subs| subs.conversation = Some(sub));
    }

    /// Leave the current conversation, if any. Returns the conversation left.
    pub async fn leave_conversation(&self, conn: &Arc<Connection>) -> Option<Uuid> {
        let conversation_id = conn
            .conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        {
            let mut guard = self.inner.write().await;
            if let Some(set) = guard.by_conversation.get_mut(&conversation_id) {
                set.remove(&conn.id());
                if set.is_empty() {
                    guard.by_conversation.remove(&conversation_id);
                }
            }
        }

        if let Some(sub) = conn.with_subscriptions(|subs| subs.conversation.take()) {
            sub.cancel();
        }
        Some(conversation_id)
    }

    /// Deliver to every local connection of `user_id`, then publish to
    /// `user:<id>` for the rest of the fleet.
    pub async fn broadcast_to_user(&self, user_id: Uuid, frame: ServerFrame) {
        let targets: Vec<Arc<Connection>> = {
            let guard = self.inner.read().await;
            guard
                .by_user
                .get(&user_id)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default()
        };
        for conn in &targets {
            conn.deliver(frame.clone(), "local");
        }

        self.broker.publish(Topic::User(user_id), frame, None).await;
    }

    /// Deliver to every local connection joined to `conversation_id` except
    /// those owned by `exclude_user_id`, then publish with the same
    /// exclusion so remote processes filter identically.
    pub async fn broadcast_to_conversation(
        &self,
        conversation_id: Uuid,
        frame: ServerFrame,
        exclude_user_id: Option<Uuid>,
    ) {
        let targets: Vec<Arc<Connection>> = {
            let guard = self.inner.read().await;
            guard
                .by_conversation
                .get(&conversation_id)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default()
        };
        for conn in &targets {
            if exclude_user_id.is_some() && conn.user_id() == exclude_user_id {
                continue;
            }
            conn.deliver(frame.clone(), "local");
        }

        self.broker
            .publish(Topic::Conversation(conversation_id), frame, exclude_user_id)
            .await;
    }

    pub async fn user_connection_count(&self, user_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.by_user.get(&user_id).map(|s| s.len()).unwrap_or(0)
    }

    pub async fn conversation_connection_count(&self, conversation_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard
            .by_conversation
            .get(&conversation_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        let guard = self.inner.read().await;
        guard.by_user.values().map(|s| s.len()).sum()
    }
}
