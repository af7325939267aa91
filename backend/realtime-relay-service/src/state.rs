use crate::{
    broker::{memory::MemoryBroker, BrokerBridge, ProcessId},
    config::Config,
    services::{
        directory::ChatDirectory,
        presence::{MemoryPresenceStore, PresenceStore, PresenceTracker},
    },
    websocket::{session::SessionTable, typing::TypingCoordinator, ConnectionRegistry},
};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub presence: PresenceTracker,
    pub typing: TypingCoordinator,
    pub sessions: SessionTable,
    pub directory: Arc<dyn ChatDirectory>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        broker: BrokerBridge,
        presence_store: Arc<dyn PresenceStore>,
        directory: Arc<dyn ChatDirectory>,
    ) -> Self {
        let registry = ConnectionRegistry::new(broker);
        let typing = TypingCoordinator::new(registry.clone(), config.typing_timeout);
        let presence = PresenceTracker::new(presence_store, config.presence.ttl);
        Self {
            registry,
            presence,
            typing,
            sessions: SessionTable::default(),
            directory,
            config,
        }
    }

    /// One process attached to an in-process broker hub. Returns the state
    /// and the broker dispatcher task.
    pub fn with_hub(
        config: Arc<Config>,
        hub: &MemoryBroker,
        presence_store: Arc<dyn PresenceStore>,
        directory: Arc<dyn ChatDirectory>,
    ) -> (Self, JoinHandle<()>) {
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let transport = Arc::new(hub.connect(inbound_tx));
        let (bridge, dispatcher) = BrokerBridge::start(ProcessId::generate(), transport, inbound_rx);
        (
            Self::new(config, bridge, presence_store, directory),
            dispatcher,
        )
    }

    /// Single process with default settings and in-memory infrastructure.
    pub fn standalone(directory: Arc<dyn ChatDirectory>) -> Self {
        let (state, _dispatcher) = Self::with_hub(
            Arc::new(Config::test_defaults()),
            &MemoryBroker::new(),
            Arc::new(MemoryPresenceStore::new()),
            directory,
        );
        state
    }
}
