//! Per-connection protocol handling, independent of the socket transport.

use super::message_types::{ClientFrame, ServerFrame};
use super::{Connection, ConnectionId};
use crate::metrics;
use crate::services::directory::{Identity, ReadMessage};
use crate::state::AppState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, not yet handed to the session.
    Connecting,
    Authenticating,
    Authenticated,
    Joined(Uuid),
    Closed,
}

pub struct Session {
    app: AppState,
    connection: Arc<Connection>,
    state: SessionState,
}

impl Session {
    pub fn new(app: AppState, connection: Arc<Connection>) -> Self {
        Self {
            app,
            connection,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Start accepting frames.
    pub fn open(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Authenticating;
        }
    }

    fn identity(&self) -> Option<Identity> {
        self.connection.identity().cloned()
    }

    fn reply(&self, frame: ServerFrame) {
        self.connection.send(frame);
    }

    fn reject(&self, message: &str) {
        self.reply(ServerFrame::error(message));
    }

    pub async fn handle_text(&mut self, text: &str) {
        match ClientFrame::parse(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                tracing::debug!(connection = ?self.connection.id(), error = %e, "unparseable frame");
                self.reject("invalid message format");
            }
        }
    }

    pub async fn handle_frame(&mut self, frame: ClientFrame) {
        match (self.state, frame) {
            (SessionState::Closed, _) | (SessionState::Connecting, _) => {}
            (SessionState::Authenticating, ClientFrame::Auth { token }) => {
                self.authenticate(&token).await
            }
            (SessionState::Authenticating, frame) => {
                tracing::debug!(kind = frame.kind(), "frame before authentication");
                self.reject("not authenticated");
            }
            (_, ClientFrame::Auth { .. }) => self.reject("already authenticated"),
            (_, ClientFrame::Join { conversation_id }) => self.join(conversation_id).await,
            (_, ClientFrame::Leave) => self.leave().await,
            (SessionState::Joined(conversation_id), ClientFrame::Typing) => {
                if let Some(identity) = self.identity() {
                    self.app
                        .typing
                        .on_typing(
                            conversation_id,
                            identity.user_id,
                            &identity.username,
                            self.connection.id(),
                        )
                        .await;
                }
            }
            (SessionState::Joined(conversation_id), ClientFrame::StopTyping) => {
                if let Some(user_id) = self.connection.user_id() {
                    self.app.typing.on_stop_typing(conversation_id, user_id).await;
                }
            }
            (SessionState::Joined(conversation_id), ClientFrame::MarkRead { message_ids }) => {
                self.mark_read(conversation_id, message_ids).await
            }
            (_, frame) => {
                tracing::debug!(kind = frame.kind(), "frame requires a joined conversation");
                self.reject("not in a conversation");
            }
        }
    }

    async fn authenticate(&mut self, token: &str) {
        let identity = match self.app.directory.verify_session(token).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                self.reject("invalid token");
                self.connection.close();
                self.state = SessionState::Closed;
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "session verification failed");
                self.reject("authentication failed");
                self.connection.close();
                self.state = SessionState::Closed;
                return;
            }
        };

        let user_id = identity.user_id;
        if !self.connection.bind_identity(identity.clone()) {
            self.reject("already authenticated");
            return;
        }
        self.state = SessionState::Authenticated;

        let local = self.app.registry.add_connection(&self.connection).await;
        let fleet_first = match self.app.presence.register_connection(user_id).await {
            Ok(first) => first,
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "presence registration failed");
                false
            }
        };

        self.reply(ServerFrame::Authenticated { user_id });
        tracing::info!(%user_id, connection = ?self.connection.id(), local, "session authenticated");

        if local == 1 && fleet_first {
            metrics::PRESENCE_TRANSITIONS
                .with_label_values(&["online"])
                .inc();
            self.announce(
                &identity,
                ServerFrame::UserOnline {
                    user_id,
                    username: identity.username.clone(),
                },
            )
            .await;
        }
    }

    async fn join(&mut self, conversation_id: Uuid) {
        let Some(user_id) = self.connection.user_id() else {
            return;
        };

        match self
            .app
            .directory
            .is_conversation_participant(conversation_id, user_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.reject("not a participant of this conversation");
                return;
            }
            Err(e) => {
                tracing::error!(%conversation_id, %user_id, error = %e, "participant check failed");
                self.reject("failed to join conversation");
                return;
            }
        }

        if let SessionState::Joined(previous) = self.state {
            if previous == conversation_id {
                self.reply(ServerFrame::Joined { conversation_id });
                return;
            }
            self.depart(previous, user_id).await;
        }

        self.app
            .registry
            .join_conversation(&self.connection, conversation_id)
            .await;
        if let Err(e) = self
            .app
            .presence
            .set_active_conversation(user_id, conversation_id)
            .await
        {
            tracing::warn!(%user_id, error = %e, "failed to record active conversation");
        }
        self.state = SessionState::Joined(conversation_id);
        self.reply(ServerFrame::Joined { conversation_id });
    }

    async fn leave(&mut self) {
        if let SessionState::Joined(conversation_id) = self.state {
            if let Some(user_id) = self.connection.user_id() {
                self.depart(conversation_id, user_id).await;
            }
            self.state = SessionState::Authenticated;
        }
        self.reply(ServerFrame::Left);
    }

    /// End this connection's typing indicator, leave the conversation and
    /// release its hold on the viewing pointer.
    async fn depart(&self, conversation_id: Uuid, user_id: Uuid) {
        self.app
            .typing
            .release(conversation_id, user_id, self.connection.id())
            .await;
        self.app.registry.leave_conversation(&self.connection).await;
        if let Err(e) = self
            .app
            .presence
            .clear_active_conversation(user_id, conversation_id)
            .await
        {
            tracing::warn!(%user_id, error = %e, "failed to clear active conversation");
        }
    }

    async fn mark_read(&mut self, conversation_id: Uuid, message_ids: Vec<Uuid>) {
        let Some(user_id) = self.connection.user_id() else {
            return;
        };

        let rows = match self
            .app
            .directory
            .mark_messages_read(&message_ids, conversation_id, user_id)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(%conversation_id, error = %e, "mark read failed");
                self.reject("failed to mark messages read");
                return;
            }
        };

        for (sender_id, message_ids) in group_by_sender(&rows) {
            self.app
                .registry
                .broadcast_to_user(
                    sender_id,
                    ServerFrame::MessagesRead {
                        conversation_id,
                        message_ids,
                        read_by: user_id,
                    },
                )
                .await;
        }
    }

    /// Tell the user's conversation partners about a presence change,
    /// honouring everyone's hide-status setting.
    async fn announce(&self, identity: &Identity, frame: ServerFrame) {
        let directory = &self.app.directory;
        match directory.is_status_hidden(identity.user_id).await {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                tracing::warn!(user_id = %identity.user_id, error = %e, "status privacy lookup failed");
                return;
            }
        }

        let partners = match directory.conversation_partners(identity.user_id).await {
            Ok(partners) => partners,
            Err(e) => {
                tracing::warn!(user_id = %identity.user_id, error = %e, "partner lookup failed");
                return;
            }
        };

        for partner in partners {
            match directory.is_status_hidden(partner).await {
                Ok(false) => {
                    self.app
                        .registry
                        .broadcast_to_user(partner, frame.clone())
                        .await
                }
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!(%partner, error = %e, "status privacy lookup failed");
                }
            }
        }
    }

    /// Keep the fleet-wide presence record fresh while the socket lives.
    pub async fn refresh_presence(&self) {
        if let Some(user_id) = self.connection.user_id() {
            let conversation_id = match self.state {
                SessionState::Joined(conversation_id) => Some(conversation_id),
                _ => None,
            };
            if let Err(e) = self.app.presence.refresh(user_id, conversation_id).await {
                tracing::warn!(%user_id, error = %e, "presence refresh failed");
            }
        }
    }

    /// Close the socket if authentication has not completed yet.
    pub fn expire_authentication(&mut self) {
        if matches!(
            self.state,
            SessionState::Connecting | SessionState::Authenticating
        ) {
            self.reject("authentication timeout");
            self.connection.close();
            self.state = SessionState::Closed;
        }
    }

    /// Full teardown. Idempotent. The state only becomes `Closed` once the
    /// connection is out of the registry and the presence store, so a
    /// teardown interrupted before that point can be run again.
    pub async fn close(&mut self) {
        let previous = self.state;
        if previous == SessionState::Closed {
            return;
        }
        self.connection.close();

        let Some(identity) = self.identity() else {
            self.state = SessionState::Closed;
            return;
        };
        let user_id = identity.user_id;

        if let SessionState::Joined(conversation_id) = previous {
            self.depart(conversation_id, user_id).await;
            self.state = SessionState::Authenticated;
        }
        let remaining = self.app.registry.remove_connection(&self.connection).await;

        let fleet_last = match self.app.presence.unregister_connection(user_id).await {
            Ok(last) => last,
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "presence unregistration failed");
                false
            }
        };
        self.state = SessionState::Closed;
        tracing::info!(%user_id, connection = ?self.connection.id(), remaining, "session closed");

        if remaining == 0 && fleet_last {
            metrics::PRESENCE_TRANSITIONS
                .with_label_values(&["offline"])
                .inc();
            self.announce(
                &identity,
                ServerFrame::UserOffline {
                    user_id,
                    username: identity.username.clone(),
                    last_seen_at: chrono::Utc::now(),
                },
            )
            .await;
        }
    }
}

pub type SharedSession = Arc<AsyncMutex<Session>>;

/// Sessions still open on this process, so shutdown can tear down the ones
/// whose sockets were dropped without their actor stopping.
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<Mutex<HashMap<ConnectionId, SharedSession>>>,
}

impl SessionTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, SharedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: ConnectionId, session: SharedSession) {
        self.lock().insert(id, session);
    }

    pub fn remove(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session still in the table. Returns how many there were.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<SharedSession> = self.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.lock().await.close().await;
        }
        sessions.len()
    }
}

/// Group changed rows by original author, keeping first-seen order.
fn group_by_sender(rows: &[ReadMessage]) -> Vec<(Uuid, Vec<Uuid>)> {
    let mut groups: Vec<(Uuid, Vec<Uuid>)> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    for row in rows {
        match index.get(&row.sender_id) {
            Some(&i) => groups[i].1.push(row.id),
            None => {
                index.insert(row.sender_id, groups.len());
                groups.push((row.sender_id, vec![row.id]));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::directory::StaticDirectory;
    use crate::websocket::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn open_session(
        app: &AppState,
    ) -> (Session, UnboundedReceiver<Outbound>) {
        let (conn, rx) = Connection::new();
        let mut session = Session::new(app.clone(), conn);
        session.open();
        (session, rx)
    }

    #[test]
    fn groups_rows_by_sender() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (m1, m2, m3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let rows = [
            ReadMessage { id: m1, sender_id: a },
            ReadMessage { id: m3, sender_id: b },
            ReadMessage { id: m2, sender_id: a },
        ];
        assert_eq!(
            group_by_sender(&rows),
            vec![(a, vec![m1, m2]), (b, vec![m3])]
        );
    }

    #[tokio::test]
    async fn frames_before_auth_are_rejected_without_closing() {
        let directory = Arc::new(StaticDirectory::new());
        let app = AppState::standalone(directory);
        let (mut session, mut rx) = open_session(&app);

        session.handle_text(r#"{"type":"typing"}"#).await;
        session.handle_text("not json").await;
        session.handle_text(r#"{"type":"dance"}"#).await;

        let out = drain(&mut rx);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|o| matches!(o, Outbound::Frame(ServerFrame::Error { .. }))));
        assert_eq!(session.state(), SessionState::Authenticating);
        assert!(session.connection().is_open());
    }

    #[tokio::test]
    async fn bad_token_closes() {
        let directory = Arc::new(StaticDirectory::new());
        let app = AppState::standalone(directory);
        let (mut session, mut rx) = open_session(&app);

        session.handle_text(r#"{"type":"auth","token":"nope"}"#).await;

        let out = drain(&mut rx);
        assert!(matches!(out[0], Outbound::Frame(ServerFrame::Error { .. })));
        assert_eq!(out[1], Outbound::Close);
        assert!(!session.connection().is_open());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn join_requires_membership() {
        let directory = Arc::new(StaticDirectory::new());
        let alice = directory.add_user("alice", "tok-a");
        let bob = directory.add_user("bob", "tok-b");
        let theirs = directory.add_conversation(&[bob]);
        let ours = directory.add_conversation(&[alice, bob]);
        let app = AppState::standalone(directory);
        let (mut session, mut rx) = open_session(&app);

        session.handle_text(r#"{"type":"auth","token":"tok-a"}"#).await;
        session
            .handle_frame(ClientFrame::Join {
                conversation_id: theirs,
            })
            .await;
        assert_eq!(session.state(), SessionState::Authenticated);

        session
            .handle_frame(ClientFrame::Join {
                conversation_id: ours,
            })
            .await;
        assert_eq!(session.state(), SessionState::Joined(ours));
        assert!(app.presence.is_viewing(alice, ours).await.unwrap());

        session.handle_frame(ClientFrame::Leave).await;
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(!app.presence.is_viewing(alice, ours).await.unwrap());

        let out = drain(&mut rx);
        assert_eq!(
            out,
            vec![
                Outbound::Frame(ServerFrame::Authenticated { user_id: alice }),
                Outbound::Frame(ServerFrame::error("not a participant of this conversation")),
                Outbound::Frame(ServerFrame::Joined {
                    conversation_id: ours
                }),
                Outbound::Frame(ServerFrame::Left),
            ]
        );
    }

    #[tokio::test]
    async fn auth_timeout_only_applies_before_auth() {
        let directory = Arc::new(StaticDirectory::new());
        directory.add_user("alice", "tok-a");
        let app = AppState::standalone(directory);

        let (mut waiting, mut waiting_rx) = open_session(&app);
        waiting.expire_authentication();
        assert_eq!(drain(&mut waiting_rx).last(), Some(&Outbound::Close));

        let (mut done, mut done_rx) = open_session(&app);
        done.handle_text(r#"{"type":"auth","token":"tok-a"}"#).await;
        done.expire_authentication();
        assert!(done.connection().is_open());
        assert!(!drain(&mut done_rx).contains(&Outbound::Close));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_presence() {
        let directory = Arc::new(StaticDirectory::new());
        let alice = directory.add_user("alice", "tok-a");
        let app = AppState::standalone(directory);
        let (mut session, _rx) = open_session(&app);

        session.handle_text(r#"{"type":"auth","token":"tok-a"}"#).await;
        assert!(app.presence.is_online(alice).await.unwrap());

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!app.presence.is_online(alice).await.unwrap());
        assert_eq!(app.registry.user_connection_count(alice).await, 0);
    }

    #[tokio::test]
    async fn close_all_tears_down_abandoned_sessions() {
        let directory = Arc::new(StaticDirectory::new());
        let alice = directory.add_user("alice", "tok-a");
        let bob = directory.add_user("bob", "tok-b");
        let conversation = directory.add_conversation(&[alice, bob]);
        let app = AppState::standalone(directory);
        let table = SessionTable::default();

        for token in ["tok-a", "tok-a", "tok-b"] {
            let (mut session, _rx) = open_session(&app);
            session
                .handle_text(&format!(r#"{{"type":"auth","token":"{token}"}}"#))
                .await;
            session
                .handle_frame(ClientFrame::Join { conversation_id: conversation })
                .await;
            let id = session.connection().id();
            table.insert(id, Arc::new(AsyncMutex::new(session)));
        }
        assert!(app.presence.is_viewing(alice, conversation).await.unwrap());

        assert_eq!(table.close_all().await, 3);
        assert!(table.is_empty());
        assert_eq!(app.registry.connection_count().await, 0);
        assert!(!app.presence.is_online(alice).await.unwrap());
        assert!(!app.presence.is_online(bob).await.unwrap());
        assert!(!app.presence.is_viewing(alice, conversation).await.unwrap());
        assert_eq!(table.close_all().await, 0);
    }
}
