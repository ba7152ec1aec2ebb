//! Server configuration.
//!
//! Defaults suit local development. `from_env` overlays `TUTOR_LIVE_*`
//! variables (after loading a `.env` file if present):
//!
//! | Variable                         | Field                   |
//! |----------------------------------|-------------------------|
//! | `TUTOR_LIVE_BIND_ADDR`           | `bind_addr`             |
//! | `TUTOR_LIVE_STORAGE_PATH`        | `storage_path`          |
//! | `TUTOR_LIVE_JWT_SECRET`          | `jwt_secret`            |
//! | `TUTOR_LIVE_BROADCAST_CAPACITY`  | `broadcast_capacity`    |
//! | `TUTOR_LIVE_OUTBOUND_QUEUE`      | `outbound_queue`        |
//! | `TUTOR_LIVE_AUTH_TIMEOUT_MS`     | `auth_timeout`          |
//! | `TUTOR_LIVE_LOCK_TIMEOUT_MS`     | `lock_timeout`          |
//! | `TUTOR_LIVE_PERSIST_ATTEMPTS`    | `persist_attempts`      |
//! | `TUTOR_LIVE_PERSIST_BACKOFF_MS`  | `persist_backoff`       |
//! | `TUTOR_LIVE_ROOM_CREATE_LIMIT`   | `room_create_limit`     |
//! | `TUTOR_LIVE_ROOM_CREATE_WINDOW_SECS` | `room_create_window` |
//! | `TUTOR_LIVE_HISTORY_PAGE_SIZE`   | `history_page_size`     |
//! | `TUTOR_LIVE_MAX_HISTORY_PAGE`    | `max_history_page`      |
//! | `TUTOR_LIVE_MAX_CHAT_BODY`       | `max_chat_body`         |
//! | `TUTOR_LIVE_MAX_STROKE_PAYLOAD`  | `max_stroke_payload`    |
//! | `TUTOR_LIVE_HIDE_ROOM_EXISTENCE` | `hide_room_existence`   |
//! | `TUTOR_LIVE_SWEEP_INTERVAL_SECS` | `sweep_interval`        |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::chat::ChatLimits;
use crate::registry::RegistryConfig;
use crate::storage::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// HS256 secret for bearer tokens
    pub jwt_secret: Option<String>,
    /// Events buffered per room receiver before it counts as lagging
    pub broadcast_capacity: usize,
    /// Frames buffered per connection before it counts as slow
    pub outbound_queue: usize,
    /// Grace period for the `Hello` frame
    pub auth_timeout: Duration,
    /// Longest wait for a room's serialization point
    pub lock_timeout: Duration,
    pub persist_attempts: u32,
    pub persist_backoff: Duration,
    pub room_create_limit: u32,
    pub room_create_window: Duration,
    /// Chat page size on subscribe and for zero-sized requests
    pub history_page_size: usize,
    pub max_history_page: usize,
    /// Bytes
    pub max_chat_body: usize,
    /// Bytes
    pub max_stroke_payload: usize,
    /// Report unknown rooms as access denied
    pub hide_room_existence: bool,
    /// How often expired rate counters and idle rooms are evicted
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            jwt_secret: None,
            broadcast_capacity: 256,
            outbound_queue: 256,
            auth_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(2),
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(50),
            room_create_limit: 10,
            room_create_window: Duration::from_secs(60),
            history_page_size: 50,
            max_history_page: 200,
            max_chat_body: 4096,
            max_stroke_payload: 64 * 1024,
            hide_room_existence: true,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Short timeouts for tests.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            auth_timeout: Duration::from_millis(500),
            lock_timeout: Duration::from_millis(500),
            persist_backoff: Duration::from_millis(5),
            sweep_interval: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `TUTOR_LIVE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("No .env file loaded: {e}");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup("TUTOR_LIVE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("TUTOR_LIVE_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(secret) = lookup("TUTOR_LIVE_JWT_SECRET") {
            config.jwt_secret = Some(secret);
        }

        let env = Lookup(&lookup);
        env.parse("TUTOR_LIVE_BROADCAST_CAPACITY", &mut config.broadcast_capacity)?;
        env.parse("TUTOR_LIVE_OUTBOUND_QUEUE", &mut config.outbound_queue)?;
        env.millis("TUTOR_LIVE_AUTH_TIMEOUT_MS", &mut config.auth_timeout)?;
        env.millis("TUTOR_LIVE_LOCK_TIMEOUT_MS", &mut config.lock_timeout)?;
        env.parse("TUTOR_LIVE_PERSIST_ATTEMPTS", &mut config.persist_attempts)?;
        env.millis("TUTOR_LIVE_PERSIST_BACKOFF_MS", &mut config.persist_backoff)?;
        env.parse("TUTOR_LIVE_ROOM_CREATE_LIMIT", &mut config.room_create_limit)?;
        env.secs("TUTOR_LIVE_ROOM_CREATE_WINDOW_SECS", &mut config.room_create_window)?;
        env.parse("TUTOR_LIVE_HISTORY_PAGE_SIZE", &mut config.history_page_size)?;
        env.parse("TUTOR_LIVE_MAX_HISTORY_PAGE", &mut config.max_history_page)?;
        env.parse("TUTOR_LIVE_MAX_CHAT_BODY", &mut config.max_chat_body)?;
        env.parse("TUTOR_LIVE_MAX_STROKE_PAYLOAD", &mut config.max_stroke_payload)?;
        env.parse("TUTOR_LIVE_HIDE_ROOM_EXISTENCE", &mut config.hide_room_existence)?;
        env.secs("TUTOR_LIVE_SWEEP_INTERVAL_SECS", &mut config.sweep_interval)?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.persist_attempts,
            backoff: self.persist_backoff,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            lock_timeout: self.lock_timeout,
            retry: self.retry_policy(),
        }
    }

    pub fn chat_limits(&self) -> ChatLimits {
        ChatLimits {
            max_body: self.max_chat_body,
            default_page: self.history_page_size,
            max_page: self.max_history_page,
        }
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, key: &'static str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = (self.0)(key) {
            let parsed = value.trim().parse::<T>();
            match parsed {
                Ok(parsed) => *slot = parsed,
                Err(_) => return Err(ConfigError::Invalid { key, value }),
            }
        }
        Ok(())
    }

    fn millis(&self, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut ms = slot.as_millis() as u64;
        self.parse(key, &mut ms)?;
        *slot = Duration::from_millis(ms);
        Ok(())
    }

    fn secs(&self, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut secs = slot.as_secs();
        self.parse(key, &mut secs)?;
        *slot = Duration::from_secs(secs);
        Ok(())
    }
}
