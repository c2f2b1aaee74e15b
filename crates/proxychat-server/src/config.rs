//! Server configuration loaded from environment variables.
//!
//! A `.env` file in the working directory is read first (see `main`).
//!
//! # Environment Variables
//!
//! - `PROXYCHAT_BIND`: Listen address. Default: `0.0.0.0:8080`
//! - `PORT`: Listen port on all interfaces, used when `PROXYCHAT_BIND` is unset
//! - `REDIS_URL`: `redis://` URI or bare `host:port`. Default: `localhost:6379`
//! - `REDIS_PASSWORD`: Password used when `REDIS_URL` carries none
//! - `PROXYCHAT_STORE`: `redis` (default) or `memory` for a single-instance
//!   development store
//! - `DATABASE_URL`: Postgres URL for the presence column (optional)
//! - `PROXYCHAT_OFFLINE_TTL_SECS`: Offline queue TTL. Default: `3600`
//! - `PROXYCHAT_OUTBOUND_BUFFER`: Per-connection outbound queue depth. Default: `256`
//!
//! # Examples
//!
//! ```bash
//! REDIS_URL=redis.internal:6379/2 REDIS_PASSWORD=secret cargo run
//! PROXYCHAT_STORE=memory PORT=9000 cargo run
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use proxychat_delivery::config::{DEFAULT_OFFLINE_TTL, DEFAULT_OUTBOUND_BUFFER};
use proxychat_delivery::DeliveryConfig;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_REDIS_URL: &str = "localhost:6379";

/// Errors from loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("invalid Redis URL: {0}")]
    InvalidRedisUrl(String),
}

/// Which durable store backs the offline queues and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Redis,
    /// In-process store. Only valid for a single server instance.
    Memory,
}

impl StoreBackend {
    /// Parse from a string, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Some(StoreBackend::Redis),
            "memory" | "mem" => Some(StoreBackend::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Redis => write!(f, "redis"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server listens on
    pub bind_addr: SocketAddr,
    /// Durable store backend
    pub store: StoreBackend,
    /// Normalized Redis connection URL
    pub redis_url: String,
    /// Postgres URL for presence, None for in-memory presence
    pub database_url: Option<String>,
    /// Offline queue TTL
    pub offline_ttl: Duration,
    /// Per-connection outbound queue depth
    pub outbound_buffer: usize,
}

impl ServerConfig {
    /// Load server configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let bind_addr = match (get("PROXYCHAT_BIND"), get("PORT")) {
            (Some(bind), _) => parse_var("PROXYCHAT_BIND", &bind)?,
            (None, Some(port)) => {
                let port: u16 = parse_var("PORT", &port)?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
            (None, None) => parse_var("PROXYCHAT_BIND", DEFAULT_BIND)?,
        };

        let store = match get("PROXYCHAT_STORE") {
            Some(raw) => StoreBackend::parse(&raw).ok_or(ConfigError::InvalidValue {
                var: "PROXYCHAT_STORE",
                value: raw,
            })?,
            None => StoreBackend::default(),
        };

        let redis_url = normalize_redis_url(
            &get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            get("REDIS_PASSWORD").as_deref(),
        )?;

        let offline_ttl = match get("PROXYCHAT_OFFLINE_TTL_SECS") {
            Some(raw) => {
                let secs: u64 = parse_var("PROXYCHAT_OFFLINE_TTL_SECS", &raw)?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        var: "PROXYCHAT_OFFLINE_TTL_SECS",
                        value: raw,
                    });
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_OFFLINE_TTL,
        };

        let outbound_buffer = match get("PROXYCHAT_OUTBOUND_BUFFER") {
            Some(raw) => {
                let depth: usize = parse_var("PROXYCHAT_OUTBOUND_BUFFER", &raw)?;
                if depth == 0 {
                    return Err(ConfigError::InvalidValue {
                        var: "PROXYCHAT_OUTBOUND_BUFFER",
                        value: raw,
                    });
                }
                depth
            }
            None => DEFAULT_OUTBOUND_BUFFER,
        };

        Ok(Self {
            bind_addr,
            store,
            redis_url,
            database_url: get("DATABASE_URL"),
            offline_ttl,
            outbound_buffer,
        })
    }

    /// Delivery tunables derived from this configuration.
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig::default()
            .with_offline_ttl(self.offline_ttl)
            .with_outbound_buffer(self.outbound_buffer)
    }

    /// Log the current server configuration, without secrets.
    pub fn log_config(&self) {
        info!("Listening on {}", self.bind_addr);
        info!("Store backend: {}", self.store);
        match self.store {
            StoreBackend::Redis => info!("Redis: {}", redact_url(&self.redis_url)),
            StoreBackend::Memory => {
                warn!("In-memory store: offline queues and relay are local to this process")
            }
        }
        match &self.database_url {
            Some(url) => info!("Presence database: {}", redact_url(url)),
            None => warn!("DATABASE_URL not set, presence flags kept in memory"),
        }
        info!("Offline TTL: {}s", self.offline_ttl.as_secs());
        info!("Outbound buffer: {}", self.outbound_buffer);
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
    })
}

/// Turn `REDIS_URL` into a connection URL.
///
/// Accepts a full `redis://` / `rediss://` URI or a bare `host:port[/db]`.
/// `password` is applied only when the URL has none of its own.
pub fn normalize_redis_url(raw: &str, password: Option<&str>) -> Result<String, ConfigError> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("redis://{}", raw)
    };

    let mut url =
        Url::parse(&with_scheme).map_err(|e| ConfigError::InvalidRedisUrl(e.to_string()))?;

    if !matches!(url.scheme(), "redis" | "rediss") {
        return Err(ConfigError::InvalidRedisUrl(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidRedisUrl("missing host".to_string()));
    }

    if let Some(password) = password.filter(|p| !p.is_empty()) {
        if url.password().is_none() {
            url.set_password(Some(password))
                .map_err(|_| ConfigError::InvalidRedisUrl("cannot set password".to_string()))?;
        }
    }

    Ok(url.to_string())
}

/// Replace any password in a URL for logging.
fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable>".to_string(),
    }
}
