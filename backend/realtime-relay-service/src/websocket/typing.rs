//! Debounced typing indicators.
//!
//! Each (conversation, user) key is either idle or typing. `typing` is
//! broadcast when a key leaves idle; further keystrokes only push the stop
//! timer back. `stop_typing` is broadcast once, when the key returns to idle
//! through an explicit stop, the timer, or the typing connection going away.
//! The key remembers which of the user's connections typed last; another tab
//! of the same user leaving the conversation does not end the indicator.

use super::message_types::ServerFrame;
use super::{ConnectionId, ConnectionRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

type TypingKey = (Uuid, Uuid);

struct TypingTimer {
    generation: u64,
    owner: ConnectionId,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerTable {
    timers: HashMap<TypingKey, TypingTimer>,
    next_generation: u64,
}

#[derive(Clone)]
pub struct TypingCoordinator {
    table: Arc<Mutex<TimerTable>>,
    registry: ConnectionRegistry,
    timeout: Duration,
}

impl TypingCoordinator {
    pub fn new(registry: ConnectionRegistry, timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(TimerTable::default())),
            registry,
            timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimerTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn on_typing(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        username: &str,
        connection_id: ConnectionId,
    ) {
        let key = (conversation_id, user_id);
        let started = {
            let mut table = self.lock();
            table.next_generation += 1;
            let generation = table.next_generation;

            let coordinator = self.clone();
            let timeout = self.timeout;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                coordinator.expire(key, generation).await;
            });

            let timer = TypingTimer {
                generation,
                owner: connection_id,
                handle,
            };
            match table.timers.insert(key, timer) {
                Some(previous) => {
                    previous.handle.abort();
                    false
                }
                None => true,
            }
        };

        if started {
            self.registry
                .broadcast_to_conversation(
                    conversation_id,
                    ServerFrame::Typing {
                        user_id,
                        username: username.to_string(),
                    },
                    Some(user_id),
                )
                .await;
        }
    }

    /// Returns `true` if the key was typing and a stop was broadcast.
    pub async fn on_stop_typing(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        let key = (conversation_id, user_id);
        let removed = self.lock().timers.remove(&key);
        match removed {
            Some(timer) => {
                timer.handle.abort();
                self.broadcast_stop(conversation_id, user_id).await;
                true
            }
            None => false,
        }
    }

    /// `connection_id` is leaving the conversation. Ends the indicator only if
    /// that connection is the one typing.
    pub async fn release(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        connection_id: ConnectionId,
    ) -> bool {
        let key = (conversation_id, user_id);
        let removed = {
            let mut table = self.lock();
            match table.timers.get(&key) {
                Some(timer) if timer.owner == connection_id => table.timers.remove(&key),
                _ => None,
            }
        };
        match removed {
            Some(timer) => {
                timer.handle.abort();
                self.broadcast_stop(conversation_id, user_id).await;
                true
            }
            None => false,
        }
    }

    async fn expire(&self, key: TypingKey, generation: u64) {
        let expired = {
            let mut table = self.lock();
            match table.timers.get(&key) {
                // Dropping our own handle detaches; the task is already finishing.
                Some(timer) if timer.generation == generation => {
                    table.timers.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if expired {
            self.broadcast_stop(key.0, key.1).await;
        }
    }

    async fn broadcast_stop(&self, conversation_id: Uuid, user_id: Uuid) {
        self.registry
            .broadcast_to_conversation(
                conversation_id,
                ServerFrame::StopTyping { user_id },
                Some(user_id),
            )
            .await;
    }

    pub fn is_typing(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        self.lock().timers.contains_key(&(conversation_id, user_id))
    }

    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }

    /// Abort every timer without broadcasting. Used at shutdown.
    pub fn shutdown(&self) {
        let mut table = self.lock();
        for (_, timer) in table.timers.drain() {
            timer.handle.abort();
        }
    }
}
