use actix_web::{web, App, HttpServer};
use anyhow::Context;
use realtime_relay_service::{
    broker::{memory::MemoryBroker, redis::RedisTransport, BrokerBridge, ProcessId},
    config, db, logging,
    redis_client::RedisClient,
    routes,
    services::{
        directory::PgDirectory,
        presence::{MemoryPresenceStore, PresenceStore, RedisPresenceStore},
    },
    state::AppState,
};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let pool = db::init_pool(&cfg.database_url, cfg.database_max_connections)
        .map_err(|e| anyhow::anyhow!("db: {e}"))?;
    let directory = Arc::new(PgDirectory::new(pool));

    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let state = match cfg.redis_url.as_deref() {
        Some(url) => {
            let redis = RedisClient::from_url(url)
                .await
                .context("failed to connect to redis")?;
            let (inbound_tx, inbound_rx) = unbounded_channel();
            let transport = Arc::new(RedisTransport::start(redis.clone(), inbound_tx));
            let (bridge, dispatcher) = BrokerBridge::start(ProcessId::generate(), transport, inbound_rx);
            background.push(dispatcher);

            let store: Arc<dyn PresenceStore> =
                Arc::new(RedisPresenceStore::new(redis, cfg.presence.ttl));
            AppState::new(cfg.clone(), bridge, store, directory)
        }
        None => {
            tracing::warn!("REDIS_URL not set, running standalone with the in-process broker");
            let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
            let (state, dispatcher) =
                AppState::with_hub(cfg.clone(), &MemoryBroker::new(), store, directory);
            background.push(dispatcher);
            state
        }
    };

    background.push(state.presence.spawn_sweeper(cfg.presence.sweep_interval));

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, process_id = %state.registry.broker().process_id(), "starting realtime-relay-service");

    let app_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .with_context(|| format!("bind {bind_addr}"))?
    .run();

    let result = server.await;

    let closed = state.sessions.close_all().await;
    tracing::info!(closed, "server stopped, shutting down background tasks");
    state.typing.shutdown();
    for task in background {
        task.abort();
    }

    result.context("http server failed")
}
