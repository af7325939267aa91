//! Fleet-wide presence
//!
//! A user is online while at least one of their connections is alive on any
//! process. Each process reports connections as they come and go; a shared
//! store keeps the per-user connection count, the last registration time, the
//! last-seen time and the conversation the user is currently viewing, along
//! with how many of the user's connections have that conversation open.
//! Entries left behind by crashed processes are removed by a periodic sweep.

use crate::error::AppResult;
use crate::services::directory::ChatDirectory;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use redis::Script;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::redis_client::RedisClient;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type PresenceResult<T> = Result<T, PresenceError>;

/// Shared presence storage. Times are epoch milliseconds.
#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Count one more connection and stamp the presence record. Returns the
    /// fleet-wide connection count after the increment.
    async fn add_connection(&self, user_id: Uuid, now_ms: i64) -> PresenceResult<i64>;

    /// Count one connection less. At zero the presence record is removed and
    /// last-seen is set to `now_ms`. Returns the remaining count.
    async fn remove_connection(&self, user_id: Uuid, now_ms: i64) -> PresenceResult<i64>;

    /// Re-stamp a user that still has live connections, and keep the viewer
    /// count of `conversation_id` alive if the connection has one open.
    async fn refresh(
        &self,
        user_id: Uuid,
        conversation_id: Option<Uuid>,
        now_ms: i64,
    ) -> PresenceResult<()>;

    async fn exists(&self, user_id: Uuid) -> PresenceResult<bool>;

    async fn last_seen(&self, user_id: Uuid) -> PresenceResult<Option<i64>>;

    /// Drop records stamped at or before `cutoff_ms`. Returns how many went.
    async fn remove_older_than(&self, cutoff_ms: i64) -> PresenceResult<usize>;

    /// Point the user at `conversation_id` and count one more of their
    /// connections in it. Returns that count.
    async fn enter_conversation(&self, user_id: Uuid, conversation_id: Uuid)
        -> PresenceResult<i64>;

    /// Count one connection less in `conversation_id`. When none is left the
    /// pointer is cleared, but only if it still names `conversation_id`.
    /// Returns the remaining count.
    async fn leave_conversation(&self, user_id: Uuid, conversation_id: Uuid)
        -> PresenceResult<i64>;

    async fn conversation(&self, user_id: Uuid) -> PresenceResult<Option<Uuid>>;
}

// ============================================================================
// Redis store
// ============================================================================

const ONLINE_KEY: &str = "presence:online";
const LAST_SEEN_KEY: &str = "presence:last_seen";
const CONNECTIONS_PREFIX: &str = "presence:connections:";
const CONVERSATION_PREFIX: &str = "presence:conversation:";
const VIEWERS_PREFIX: &str = "presence:viewers:";

static ADD_CONNECTION: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local n = redis.call('INCR', KEYS[1])
        redis.call('PEXPIRE', KEYS[1], ARGV[3])
        redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
        return n
        "#,
    )
});

static REMOVE_CONNECTION: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local n = redis.call('DECR', KEYS[1])
        if n <= 0 then
            redis.call('DEL', KEYS[1])
            redis.call('ZREM', KEYS[2], ARGV[1])
            redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
            return 0
        end
        return n
        "#,
    )
});

static SWEEP_STALE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local stale = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES')
        for i = 1, #stale, 2 do
            redis.call('HSET', KEYS[2], stale[i], stale[i + 1])
            redis.call('DEL', ARGV[2] .. stale[i])
        end
        if #stale > 0 then
            redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        end
        return #stale / 2
        "#,
    )
});

static ENTER_CONVERSATION: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local n = redis.call('INCR', KEYS[2])
        redis.call('PEXPIRE', KEYS[2], ARGV[2])
        redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
        return n
        "#,
    )
});

static LEAVE_CONVERSATION: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local n = redis.call('DECR', KEYS[2])
        if n > 0 then
            return n
        end
        redis.call('DEL', KEYS[2])
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
});

pub struct RedisPresenceStore {
    redis: RedisClient,
    /// Expiry of the per-user counter, pointer and viewer keys; refreshed on
    /// heartbeat.
    key_ttl: Duration,
}

impl RedisPresenceStore {
    pub fn new(redis: RedisClient, presence_ttl: Duration) -> Self {
        Self {
            redis,
            key_ttl: presence_ttl * 2,
        }
    }

    fn connections_key(user_id: Uuid) -> String {
        format!("{}{}", CONNECTIONS_PREFIX, user_id)
    }

    fn conversation_key(user_id: Uuid) -> String {
        format!("{}{}", CONVERSATION_PREFIX, user_id)
    }

    fn viewers_key(user_id: Uuid, conversation_id: Uuid) -> String {
        format!("{}{}:{}", VIEWERS_PREFIX, user_id, conversation_id)
    }

    fn key_ttl_ms(&self) -> i64 {
        self.key_ttl.as_millis() as i64
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_connection(&self, user_id: Uuid, now_ms: i64) -> PresenceResult<i64> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let count: i64 = ADD_CONNECTION
            .key(Self::connections_key(user_id))
            .key(ONLINE_KEY)
            .arg(user_id.to_string())
            .arg(now_ms)
            .arg(self.key_ttl_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn remove_connection(&self, user_id: Uuid, now_ms: i64) -> PresenceResult<i64> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let remaining: i64 = REMOVE_CONNECTION
            .key(Self::connections_key(user_id))
            .key(ONLINE_KEY)
            .key(LAST_SEEN_KEY)
            .arg(user_id.to_string())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining)
    }

    async fn refresh(
        &self,
        user_id: Uuid,
        conversation_id: Option<Uuid>,
        now_ms: i64,
    ) -> PresenceResult<()> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let ttl_ms = self.key_ttl_ms();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(ONLINE_KEY)
            .arg(now_ms)
            .arg(user_id.to_string())
            .ignore()
            .cmd("PEXPIRE")
            .arg(Self::connections_key(user_id))
            .arg(ttl_ms)
            .ignore()
            .cmd("PEXPIRE")
            .arg(Self::conversation_key(user_id))
            .arg(ttl_ms)
            .ignore();
        if let Some(conversation_id) = conversation_id {
            pipe.cmd("PEXPIRE")
                .arg(Self::viewers_key(user_id, conversation_id))
                .arg(ttl_ms)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn exists(&self, user_id: Uuid) -> PresenceResult<bool> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(ONLINE_KEY)
            .arg(user_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(score.is_some())
    }

    async fn last_seen(&self, user_id: Uuid) -> PresenceResult<Option<i64>> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let raw: Option<String> = redis::cmd("HGET")
            .arg(LAST_SEEN_KEY)
            .arg(user_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(raw.and_then(|s| s.parse::<f64>().ok()).map(|ms| ms as i64))
    }

    async fn remove_older_than(&self, cutoff_ms: i64) -> PresenceResult<usize> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let removed: i64 = SWEEP_STALE
            .key(ONLINE_KEY)
            .key(LAST_SEEN_KEY)
            .arg(cutoff_ms)
            .arg(CONNECTIONS_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed.max(0) as usize)
    }

    async fn enter_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> PresenceResult<i64> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let viewers: i64 = ENTER_CONVERSATION
            .key(Self::conversation_key(user_id))
            .key(Self::viewers_key(user_id, conversation_id))
            .arg(conversation_id.to_string())
            .arg(self.key_ttl_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(viewers)
    }

    async fn leave_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> PresenceResult<i64> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let remaining: i64 = LEAVE_CONVERSATION
            .key(Self::conversation_key(user_id))
            .key(Self::viewers_key(user_id, conversation_id))
            .arg(conversation_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining)
    }

    async fn conversation(&self, user_id: Uuid) -> PresenceResult<Option<Uuid>> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::conversation_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(raw.and_then(|s| Uuid::parse_str(&s).ok()))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    online: HashMap<Uuid, i64>,
    connections: HashMap<Uuid, i64>,
    last_seen: HashMap<Uuid, i64>,
    conversations: HashMap<Uuid, Uuid>,
    viewers: HashMap<(Uuid, Uuid), i64>,
}

/// Process-local store with the same semantics as the Redis one. Shared
/// between simulated processes in tests by cloning the `Arc`.
#[derive(Default)]
pub struct MemoryPresenceStore {
    state: Mutex<MemoryState>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn add_connection(&self, user_id: Uuid, now_ms: i64) -> PresenceResult<i64> {
        Ok(self.with_state(|s| {
            let count = s.connections.entry(user_id).or_insert(0);
            *count += 1;
            s.online.insert(user_id, now_ms);
            *count
        }))
    }

    async fn remove_connection(&self, user_id: Uuid, now_ms: i64) -> PresenceResult<i64> {
        Ok(self.with_state(|s| {
            let remaining = s.connections.get(&user_id).copied().unwrap_or(0) - 1;
            if remaining <= 0 {
                s.connections.remove(&user_id);
                s.online.remove(&user_id);
                s.last_seen.insert(user_id, now_ms);
                0
            } else {
                s.connections.insert(user_id, remaining);
                remaining
            }
        }))
    }

    async fn refresh(
        &self,
        user_id: Uuid,
        _conversation_id: Option<Uuid>,
        now_ms: i64,
    ) -> PresenceResult<()> {
        self.with_state(|s| {
            s.online.insert(user_id, now_ms);
        });
        Ok(())
    }

    async fn exists(&self, user_id: Uuid) -> PresenceResult<bool> {
        Ok(self.with_state(|s| s.online.contains_key(&user_id)))
    }

    async fn last_seen(&self, user_id: Uuid) -> PresenceResult<Option<i64>> {
        Ok(self.with_state(|s| s.last_seen.get(&user_id).copied()))
    }

    async fn remove_older_than(&self, cutoff_ms: i64) -> PresenceResult<usize> {
        Ok(self.with_state(|s| {
            let stale: Vec<(Uuid, i64)> = s
                .online
                .iter()
                .filter(|(_, stamped)| **stamped <= cutoff_ms)
                .map(|(user, stamped)| (*user, *stamped))
                .collect();
            for (user, stamped) in &stale {
                s.online.remove(user);
                s.connections.remove(user);
                s.last_seen.insert(*user, *stamped);
            }
            stale.len()
        }))
    }

    async fn enter_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> PresenceResult<i64> {
        Ok(self.with_state(|s| {
            s.conversations.insert(user_id, conversation_id);
            let viewers = s.viewers.entry((user_id, conversation_id)).or_insert(0);
            *viewers += 1;
            *viewers
        }))
    }

    async fn leave_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> PresenceResult<i64> {
        Ok(self.with_state(|s| {
            let key = (user_id, conversation_id);
            let remaining = s.viewers.get(&key).copied().unwrap_or(0) - 1;
            if remaining > 0 {
                s.viewers.insert(key, remaining);
                return remaining;
            }
            s.viewers.remove(&key);
            if s.conversations.get(&user_id) == Some(&conversation_id) {
                s.conversations.remove(&user_id);
            }
            0
        }))
    }

    async fn conversation(&self, user_id: Uuid) -> PresenceResult<Option<Uuid>> {
        Ok(self.with_state(|s| s.conversations.get(&user_id).copied()))
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// What one user may see of another user's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatus {
    pub user_id: Uuid,
    pub online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl PresenceStatus {
    fn hidden(user_id: Uuid) -> Self {
        Self {
            user_id,
            online: false,
            last_seen_at: None,
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Record one more live connection. Returns `true` when this is the
    /// user's only connection across the fleet.
    pub async fn register_connection(&self, user_id: Uuid) -> PresenceResult<bool> {
        let count = self.store.add_connection(user_id, now_ms()).await?;
        Ok(count == 1)
    }

    /// Record a closed connection. Returns `true` when the user has no live
    /// connection left anywhere.
    pub async fn unregister_connection(&self, user_id: Uuid) -> PresenceResult<bool> {
        let remaining = self.store.remove_connection(user_id, now_ms()).await?;
        Ok(remaining <= 0)
    }

    pub async fn refresh(&self, user_id: Uuid, conversation_id: Option<Uuid>) -> PresenceResult<()> {
        self.store.refresh(user_id, conversation_id, now_ms()).await
    }

    pub async fn is_online(&self, user_id: Uuid) -> PresenceResult<bool> {
        self.store.exists(user_id).await
    }

    pub async fn last_seen(&self, user_id: Uuid) -> PresenceResult<Option<DateTime<Utc>>> {
        Ok(self.store.last_seen(user_id).await?.and_then(from_ms))
    }

    /// Remove entries not refreshed within the TTL.
    pub async fn cleanup_stale(&self) -> PresenceResult<usize> {
        let cutoff = now_ms() - self.ttl.as_millis() as i64;
        self.store.remove_older_than(cutoff).await
    }

    /// One connection of `user_id` opened `conversation_id`.
    pub async fn set_active_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> PresenceResult<()> {
        self.store.enter_conversation(user_id, conversation_id).await?;
        Ok(())
    }

    /// One connection of `user_id` left `conversation_id`. The pointer stays
    /// while any other connection of the user, on any process, is still in it.
    pub async fn clear_active_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> PresenceResult<()> {
        self.store.leave_conversation(user_id, conversation_id).await?;
        Ok(())
    }

    /// Whether `user_id` is currently viewing `conversation_id` on any process.
    pub async fn is_viewing(&self, user_id: Uuid, conversation_id: Uuid) -> PresenceResult<bool> {
        Ok(self.store.conversation(user_id).await? == Some(conversation_id))
    }

    /// Presence of `user_id` as seen by `viewer_id`, with the privacy gate
    /// applied: users who hide their status appear offline without last-seen,
    /// and see everyone else that way too.
    pub async fn status_for(
        &self,
        directory: &dyn ChatDirectory,
        viewer_id: Option<Uuid>,
        user_id: Uuid,
    ) -> AppResult<PresenceStatus> {
        if directory.is_status_hidden(user_id).await? {
            return Ok(PresenceStatus::hidden(user_id));
        }
        if let Some(viewer_id) = viewer_id {
            if viewer_id != user_id && directory.is_status_hidden(viewer_id).await? {
                return Ok(PresenceStatus::hidden(user_id));
            }
        }

        let online = self.is_online(user_id).await?;
        let last_seen_at = if online {
            None
        } else {
            self.last_seen(user_id).await?
        };
        Ok(PresenceStatus {
            user_id,
            online,
            last_seen_at,
        })
    }

    /// Periodic TTL sweep. Safe to run on every process.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match tracker.cleanup_stale().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "swept stale presence entries"),
                    Err(e) => tracing::warn!(error = %e, "presence sweep failed"),
                }
            }
        })
    }
}
