//! Simulated fleet: several relay processes sharing one in-process broker
//! hub, one presence store and one directory.

#![allow(dead_code)]

use realtime_relay_service::broker::memory::MemoryBroker;
use realtime_relay_service::config::Config;
use realtime_relay_service::services::directory::StaticDirectory;
use realtime_relay_service::services::presence::MemoryPresenceStore;
use realtime_relay_service::state::AppState;
use realtime_relay_service::websocket::message_types::{ClientFrame, ServerFrame};
use realtime_relay_service::websocket::session::Session;
use realtime_relay_service::websocket::{Connection, Outbound};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub struct Fleet {
    pub hub: MemoryBroker,
    pub store: Arc<MemoryPresenceStore>,
    pub directory: Arc<StaticDirectory>,
    pub config: Arc<Config>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_config(Config::test_defaults())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            hub: MemoryBroker::new(),
            store: Arc::new(MemoryPresenceStore::new()),
            directory: Arc::new(StaticDirectory::new()),
            config: Arc::new(config),
        }
    }

    /// Boot one more process attached to the fleet.
    pub fn process(&self) -> AppState {
        let (state, _dispatcher) = AppState::with_hub(
            self.config.clone(),
            &self.hub,
            self.store.clone(),
            self.directory.clone(),
        );
        state
    }

    pub fn user(&self, name: &str) -> TestUser {
        let token = format!("token-{name}");
        let id = self.directory.add_user(name, &token);
        TestUser {
            id,
            name: name.to_string(),
            token,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: Uuid,
    pub name: String,
    pub token: String,
}

/// One client socket driven directly through its session.
pub struct Client {
    pub session: Session,
    rx: UnboundedReceiver<Outbound>,
}

impl Client {
    pub fn open(app: &AppState) -> Self {
        let (connection, rx) = Connection::new();
        let mut session = Session::new(app.clone(), connection);
        session.open();
        Self { session, rx }
    }

    /// Open and authenticate, discarding the `authenticated` reply.
    pub async fn connect(app: &AppState, user: &TestUser) -> Self {
        let mut client = Self::open(app);
        client
            .send(ClientFrame::Auth {
                token: user.token.clone(),
            })
            .await;
        let frames = client.frames().await;
        assert!(
            frames.contains(&ServerFrame::Authenticated { user_id: user.id }),
            "auth failed: {frames:?}"
        );
        client
    }

    pub async fn join(&mut self, conversation_id: Uuid) {
        self.send(ClientFrame::Join { conversation_id }).await;
        let frames = self.frames().await;
        assert!(
            frames.contains(&ServerFrame::Joined { conversation_id }),
            "join failed: {frames:?}"
        );
    }

    pub async fn send(&mut self, frame: ClientFrame) {
        self.session.handle_frame(frame).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.session.handle_text(text).await;
    }

    /// Frames received so far, after giving broker dispatchers time to run.
    pub async fn frames(&mut self) -> Vec<ServerFrame> {
        settle().await;
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            if let Outbound::Frame(frame) = item {
                out.push(frame);
            }
        }
        out
    }

    pub async fn close(&mut self) {
        self.session.close().await;
    }
}

pub fn count_kind(frames: &[ServerFrame], kind: &str) -> usize {
    frames.iter().filter(|f| f.kind() == kind).count()
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
