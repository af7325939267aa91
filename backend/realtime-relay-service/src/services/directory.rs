//! Collaborators owned by the rest of the platform: session verification,
//! conversation membership, read receipts and the users' privacy settings.

use crate::error::AppResult;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Authenticated owner of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// A message flipped to read, with its original author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
}

#[async_trait]
pub trait ChatDirectory: Send + Sync {
    async fn verify_session(&self, token: &str) -> AppResult<Option<Identity>>;

    async fn is_conversation_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<bool>;

    /// Mark unread messages authored by someone other than `requester_id` as
    /// read, atomically. Returns only the rows that changed.
    async fn mark_messages_read(
        &self,
        message_ids: &[Uuid],
        conversation_id: Uuid,
        requester_id: Uuid,
    ) -> AppResult<Vec<ReadMessage>>;

    async fn conversation_partners(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;

    async fn is_status_hidden(&self, user_id: Uuid) -> AppResult<bool>;
}

// ============================================================================
// Postgres
// ============================================================================

pub struct PgDirectory {
    db: Pool,
}

impl PgDirectory {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ChatDirectory for PgDirectory {
    async fn verify_session(&self, token: &str) -> AppResult<Option<Identity>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT u.id, u.username
                FROM sessions s
                JOIN users u ON u.id = s.user_id
                WHERE s.id = $1
                  AND s.expires_at > NOW()
                "#,
                &[&token],
            )
            .await?;

        Ok(row.map(|row| Identity {
            user_id: row.get("id"),
            username: row.get("username"),
        }))
    }

    async fn is_conversation_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<bool> {
        let client = self.db.get().await?;
        let rec = client
            .query_opt(
                r#"
                SELECT 1
                FROM conversation_participants
                WHERE conversation_id = $1
                  AND user_id = $2
                LIMIT 1
                "#,
                &[&conversation_id, &user_id],
            )
            .await?;
        Ok(rec.is_some())
    }

    async fn mark_messages_read(
        &self,
        message_ids: &[Uuid],
        conversation_id: Uuid,
        requester_id: Uuid,
    ) -> AppResult<Vec<ReadMessage>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.db.get().await?;
        let rows = client
            .query(
                r#"
                UPDATE messages
                SET read_at = NOW()
                WHERE id = ANY($1)
                  AND conversation_id = $2
                  AND sender_id <> $3
                  AND read_at IS NULL
                RETURNING id, sender_id
                "#,
                &[&message_ids, &conversation_id, &requester_id],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ReadMessage {
                id: row.get("id"),
                sender_id: row.get("sender_id"),
            })
            .collect())
    }

    async fn conversation_partners(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                r#"
                SELECT DISTINCT other.user_id
                FROM conversation_participants mine
                JOIN conversation_participants other
                  ON other.conversation_id = mine.conversation_id
                WHERE mine.user_id = $1
                  AND other.user_id <> $1
                "#,
                &[&user_id],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.get("user_id")).collect())
    }

    async fn is_status_hidden(&self, user_id: Uuid) -> AppResult<bool> {
        let client = self.db.get().await?;
        let row = client
            .query_opt("SELECT hide_status FROM users WHERE id = $1", &[&user_id])
            .await?;
        Ok(row.map(|row| row.get::<_, bool>("hide_status")).unwrap_or(false))
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    conversation_id: Uuid,
    sender_id: Uuid,
    read: bool,
}

#[derive(Default)]
struct DirectoryState {
    users: HashMap<Uuid, String>,
    sessions: HashMap<String, Uuid>,
    hidden: HashSet<Uuid>,
    participants: HashMap<Uuid, HashSet<Uuid>>,
    messages: HashMap<Uuid, StoredMessage>,
}

/// Fixture directory for tests and local experiments.
#[derive(Default)]
pub struct StaticDirectory {
    state: Mutex<DirectoryState>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DirectoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Create a user reachable through the session `token`.
    pub fn add_user(&self, username: &str, token: &str) -> Uuid {
        let user_id = Uuid::new_v4();
        self.with_state(|s| {
            s.users.insert(user_id, username.to_string());
            s.sessions.insert(token.to_string(), user_id);
        });
        user_id
    }

    pub fn add_conversation(&self, participants: &[Uuid]) -> Uuid {
        let conversation_id = Uuid::new_v4();
        self.with_state(|s| {
            s.participants
                .insert(conversation_id, participants.iter().copied().collect());
        });
        conversation_id
    }

    pub fn add_message(&self, conversation_id: Uuid, sender_id: Uuid) -> Uuid {
        let message_id = Uuid::new_v4();
        self.with_state(|s| {
            s.messages.insert(
                message_id,
                StoredMessage {
                    conversation_id,
                    sender_id,
                    read: false,
                },
            );
        });
        message_id
    }

    pub fn set_status_hidden(&self, user_id: Uuid, hidden: bool) {
        self.with_state(|s| {
            if hidden {
                s.hidden.insert(user_id);
            } else {
                s.hidden.remove(&user_id);
            }
        });
    }
}

#[async_trait]
impl ChatDirectory for StaticDirectory {
    async fn verify_session(&self, token: &str) -> AppResult<Option<Identity>> {
        Ok(self.with_state(|s| {
            s.sessions.get(token).and_then(|user_id| {
                s.users.get(user_id).map(|username| Identity {
                    user_id: *user_id,
                    username: username.clone(),
                })
            })
        }))
    }

    async fn is_conversation_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<bool> {
        Ok(self.with_state(|s| {
            s.participants
                .get(&conversation_id)
                .map(|members| members.contains(&user_id))
                .unwrap_or(false)
        }))
    }

    async fn mark_messages_read(
        &self,
        message_ids: &[Uuid],
        conversation_id: Uuid,
        requester_id: Uuid,
    ) -> AppResult<Vec<ReadMessage>> {
        Ok(self.with_state(|s| {
            let mut changed = Vec::new();
            for id in message_ids {
                if let Some(message) = s.messages.get_mut(id) {
                    if message.conversation_id == conversation_id
                        && message.sender_id != requester_id
                        && !message.read
                    {
                        message.read = true;
                        changed.push(ReadMessage {
                            id: *id,
                            sender_id: message.sender_id,
                        });
                    }
                }
            }
            changed
        }))
    }

    async fn conversation_partners(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self.with_state(|s| {
            let partners: HashSet<Uuid> = s
                .participants
                .values()
                .filter(|members| members.contains(&user_id))
                .flat_map(|members| members.iter().copied())
                .filter(|member| *member != user_id)
                .collect();
            partners.into_iter().collect()
        }))
    }

    async fn is_status_hidden(&self, user_id: Uuid) -> AppResult<bool> {
        Ok(self.with_state(|s| s.hidden.contains(&user_id)))
    }
}
