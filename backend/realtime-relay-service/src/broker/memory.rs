//! In-process broker hub.
//!
//! Stands in for Redis when the service runs as a single instance, and lets
//! tests wire several bridges ("processes") to one shared fleet.

use super::{BrokerError, BrokerTransport, InboundMessage, InboundSender};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

struct Node {
    id: usize,
    topics: HashSet<String>,
    inbound: InboundSender,
}

#[derive(Default)]
struct HubState {
    nodes: Vec<Node>,
    next_id: usize,
    unavailable: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<HubState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new process to the hub.
    pub fn connect(&self, inbound: InboundSender) -> MemoryTransport {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        state.nodes.push(Node {
            id,
            topics: HashSet::new(),
            inbound,
        });
        MemoryTransport {
            hub: self.clone(),
            node_id: id,
        }
    }

    /// Number of processes holding a subscription to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .nodes
            .iter()
            .filter(|node| node.topics.contains(topic))
            .count()
    }

    /// Make every publish fail, as if the broker went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.unavailable = unavailable;
    }

    fn with_node(&self, node_id: usize, f: impl FnOnce(&mut Node)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = state.nodes.iter_mut().find(|n| n.id == node_id) {
            f(node);
        }
    }
}

pub struct MemoryTransport {
    hub: MemoryBroker,
    node_id: usize,
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        let mut state = self
            .hub
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.unavailable {
            return Err(BrokerError::Unavailable("in-process hub offline".into()));
        }
        // Nodes whose dispatcher is gone are detached.
        state.nodes.retain(|node| !node.inbound.is_closed());
        for node in state.nodes.iter().filter(|n| n.topics.contains(topic)) {
            let _ = node.inbound.send(InboundMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) {
        self.hub.with_node(self.node_id, |node| {
            node.topics.insert(topic.to_string());
        });
    }

    fn unsubscribe(&self, topic: &str) {
        self.hub.with_node(self.node_id, |node| {
            node.topics.remove(topic);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn delivers_only_to_subscribed_nodes() {
        let hub = MemoryBroker::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let a = hub.connect(tx_a);
        let _b = hub.connect(tx_b);

        a.subscribe("conv:1");
        a.publish("conv:1", "hello".into()).await.unwrap();

        assert_eq!(rx_a.try_recv().unwrap().payload, "hello");
        assert!(rx_b.try_recv().is_err());

        a.unsubscribe("conv:1");
        a.publish("conv:1", "again".into()).await.unwrap();
        assert!(rx_a.try_recv().is_err());
    }
}
