//! Redis pub/sub transport.
//!
//! Publishing goes through the shared connection manager. Subscriptions live
//! on one dedicated pub/sub connection owned by a background task; commands
//! are queued to it so they apply in call order. When the connection drops
//! the task reconnects with backoff and re-subscribes every active topic.

use super::{BrokerError, BrokerTransport, InboundMessage, InboundSender};
use crate::redis_client::RedisClient;
use ::redis::aio::{PubSubSink, PubSubStream};
use ::redis::AsyncCommands;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashSet;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum PubSubCommand {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct RedisTransport {
    redis: RedisClient,
    commands: UnboundedSender<PubSubCommand>,
    task: JoinHandle<()>,
}

impl RedisTransport {
    pub fn start(redis: RedisClient, inbound: InboundSender) -> Self {
        let (commands, rx) = unbounded_channel();
        let client = redis.client().clone();
        let task = tokio::spawn(run_pubsub(client, rx, inbound));
        Self {
            redis,
            commands,
            task,
        }
    }

    fn enqueue(&self, command: PubSubCommand) {
        if self.commands.send(command).is_err() {
            tracing::error!("redis pub/sub task is gone, subscription change dropped");
        }
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl BrokerTransport for RedisTransport {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let _receivers: i64 = conn.publish(topic, payload).await?;
        Ok(())
    }

    fn subscribe(&self, topic: &str) {
        self.enqueue(PubSubCommand::Subscribe(topic.to_string()));
    }

    fn unsubscribe(&self, topic: &str) {
        self.enqueue(PubSubCommand::Unsubscribe(topic.to_string()));
    }
}

fn apply(topics: &mut HashSet<String>, command: &PubSubCommand) {
    match command {
        PubSubCommand::Subscribe(topic) => {
            topics.insert(topic.clone());
        }
        PubSubCommand::Unsubscribe(topic) => {
            topics.remove(topic);
        }
    }
}

async fn execute(sink: &mut PubSubSink, command: &PubSubCommand) -> ::redis::RedisResult<()> {
    match command {
        PubSubCommand::Subscribe(topic) => sink.subscribe(topic).await,
        PubSubCommand::Unsubscribe(topic) => sink.unsubscribe(topic).await,
    }
}

async fn connect(
    client: &::redis::Client,
    topics: &HashSet<String>,
) -> ::redis::RedisResult<(PubSubSink, PubSubStream)> {
    let pubsub = client.get_async_pubsub().await?;
    let (mut sink, stream) = pubsub.split();
    for topic in topics {
        sink.subscribe(topic).await?;
    }
    Ok((sink, stream))
}

async fn run_pubsub(
    client: ::redis::Client,
    mut commands: UnboundedReceiver<PubSubCommand>,
    inbound: InboundSender,
) {
    let mut topics: HashSet<String> = HashSet::new();
    let mut backoff = INITIAL_BACKOFF;
    let mut reconnecting = false;

    loop {
        let (mut sink, mut stream) = match connect(&client, &topics).await {
            Ok(parts) => {
                if reconnecting {
                    tracing::info!(topics = topics.len(), "redis pub/sub reconnected");
                }
                reconnecting = false;
                backoff = INITIAL_BACKOFF;
                parts
            }
            Err(e) => {
                tracing::warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "redis pub/sub connect failed");
                let wait = sleep(backoff);
                tokio::pin!(wait);
                loop {
                    tokio::select! {
                        _ = &mut wait => break,
                        command = commands.recv() => match command {
                            Some(command) => apply(&mut topics, &command),
                            None => return,
                        },
                    }
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                reconnecting = true;
                continue;
            }
        };

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { return };
                    apply(&mut topics, &command);
                    if let Err(e) = execute(&mut sink, &command).await {
                        tracing::warn!(error = %e, ?command, "redis pub/sub command failed, reconnecting");
                        break;
                    }
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        tracing::warn!("redis pub/sub connection lost, reconnecting");
                        break;
                    };
                    let topic = message.get_channel_name().to_string();
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(topic = %topic, error = %e, "non-text pub/sub payload dropped");
                            continue;
                        }
                    };
                    if inbound.send(InboundMessage { topic, payload }).is_err() {
                        return;
                    }
                }
            }
        }

        reconnecting = true;
    }
}
