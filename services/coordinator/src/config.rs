use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::store::PgConfig;

/// Which backing store to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process store, state is lost on restart. Dev and test only.
    Memory,
    /// Postgres-backed store.
    Postgres,
}

/// Timing windows governing liveness, persistence, and routing.
#[derive(Debug, Clone)]
pub struct Windows {
    /// A worker silent for longer than this reads as "offline".
    pub staleness: Duration,

    /// Minimum spacing between durable writes for an unchanged status.
    pub persist_throttle: Duration,

    /// Interval workers are told to heartbeat at.
    pub heartbeat_interval: Duration,

    /// Total timeout for a proxied request.
    pub proxy_timeout: Duration,

    /// Regional coordinators silent for longer than this are pruned.
    pub coordinator_activity: Duration,
}

impl Default for Windows {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(90),
            persist_throttle: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            proxy_timeout: Duration::from_secs(30),
            coordinator_activity: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub store_backend: StoreBackend,
    pub postgres: PgConfig,
    pub windows: Windows,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid SWB_LISTEN_ADDR '{value}': {source}")]
    InvalidListenAddr {
        value: String,
        source: std::net::AddrParseError,
    },

    #[error("unknown SWB_STORE '{0}', expected 'memory' or 'postgres'")]
    UnknownStoreBackend(String),

    #[error("DATABASE_URL is required when SWB_STORE is 'postgres'")]
    MissingDatabaseUrl,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_listen = std::env::var("SWB_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let listen_addr = raw_listen
            .parse()
            .map_err(|source| ConfigError::InvalidListenAddr {
                value: raw_listen,
                source,
            })?;

        let log_level = std::env::var("SWB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("SWB_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let store_backend = match std::env::var("SWB_STORE").as_deref() {
            Ok("postgres") => StoreBackend::Postgres,
            Ok("memory") | Err(_) => StoreBackend::Memory,
            Ok(other) => return Err(ConfigError::UnknownStoreBackend(other.to_string())),
        };

        let mut postgres = PgConfig::default();
        match std::env::var("DATABASE_URL") {
            Ok(url) => postgres.database_url = url,
            Err(_) if store_backend == StoreBackend::Postgres => {
                return Err(ConfigError::MissingDatabaseUrl);
            }
            Err(_) => {}
        }

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            store_backend,
            postgres,
            windows: Windows::default(),
        })
    }
}
