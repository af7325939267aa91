use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Ping interval; a connection that misses one full interval is closed.
    pub heartbeat_interval: Duration,
    /// Time allowed between upgrade and a successful `auth` frame.
    pub auth_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Entries older than this are removed by the sweep.
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: usize,
    /// When absent the service runs standalone with the in-process broker.
    pub redis_url: Option<String>,
    pub websocket: WebSocketConfig,
    pub presence: PresenceConfig,
    pub typing_timeout: Duration,
    pub internal_api_token: Option<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::error::AppError::Config("DATABASE_URL missing".into()))?;

        let heartbeat_secs: u64 = env_or("WS_HEARTBEAT_INTERVAL_SECS", 30);
        let presence_ttl_secs: u64 = env_or("PRESENCE_TTL_SECS", 60);
        if heartbeat_secs == 0 || heartbeat_secs >= presence_ttl_secs {
            return Err(crate::error::AppError::Config(format!(
                "WS_HEARTBEAT_INTERVAL_SECS ({heartbeat_secs}) must be non-zero and below PRESENCE_TTL_SECS ({presence_ttl_secs})"
            )));
        }

        Ok(Self {
            port: env_or("PORT", 3000),
            database_url,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 16),
            redis_url: non_empty("REDIS_URL"),
            websocket: WebSocketConfig {
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                auth_timeout: Duration::from_secs(env_or("WS_AUTH_TIMEOUT_SECS", 10)),
            },
            presence: PresenceConfig {
                ttl: Duration::from_secs(presence_ttl_secs),
                sweep_interval: Duration::from_secs(env_or("PRESENCE_SWEEP_INTERVAL_SECS", 30)),
            },
            typing_timeout: Duration::from_millis(env_or("TYPING_TIMEOUT_MS", 3000)),
            internal_api_token: non_empty("INTERNAL_API_TOKEN"),
        })
    }

    pub fn test_defaults() -> Self {
        Self {
            port: 0,
            database_url: "postgres://localhost/relay_test".into(),
            database_max_connections: 1,
            redis_url: None,
            websocket: WebSocketConfig {
                heartbeat_interval: Duration::from_secs(30),
                auth_timeout: Duration::from_secs(10),
            },
            presence: PresenceConfig {
                ttl: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(30),
            },
            typing_timeout: Duration::from_secs(3),
            internal_api_token: None,
        }
    }
}
