//! Server configuration, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::admission::RateLimit;
use crate::connection::ConnectionLimits;
use crate::error::ServerError;
use crate::hub::HubConfig;
use crate::persistence::DEFAULT_DEBOUNCE;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-connection outbound queue capacity
    pub outbound_capacity: usize,
    /// Per-connection pending-save queue capacity
    pub save_capacity: usize,
    /// Idle period between keepalive pings
    pub keepalive_interval: Duration,
    /// Snapshot coalescing window
    pub save_debounce: Duration,
    /// Empty-room eviction grace (None = never evict)
    pub room_idle_grace: Option<Duration>,
    /// How long shutdown waits for open connections
    pub shutdown_grace: Duration,
    /// Deadline for a client to complete the WebSocket upgrade
    pub handshake_timeout: Duration,
    /// Upper bound on a single bus publish
    pub publish_timeout: Duration,
    /// Period of the stats log line (None = off)
    pub stats_interval: Option<Duration>,
    /// RocksDB path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Redis URL (None = in-process bus)
    pub redis_url: Option<String>,
    /// Upgrade budget per client address
    pub rate_limit: RateLimit,
    /// Deployment environment (`dev`, `prod`, ...)
    pub env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = ConnectionLimits::default();
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            outbound_capacity: limits.outbound_capacity,
            save_capacity: limits.save_capacity,
            keepalive_interval: limits.keepalive,
            save_debounce: DEFAULT_DEBOUNCE,
            room_idle_grace: Some(Duration::from_secs(60)),
            shutdown_grace: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            stats_interval: Some(Duration::from_secs(60)),
            storage_path: None,
            redis_url: None,
            rate_limit: RateLimit::default(),
            env: "dev".to_string(),
        }
    }
}

impl ServerConfig {
    /// Read from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary key lookup. Empty values count as unset;
    /// unparseable ones fall back to the default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(addr) = get("HTTP_ADDR") {
            // Bare ":port" means every interface.
            cfg.bind_addr = if addr.starts_with(':') {
                format!("0.0.0.0{addr}")
            } else {
                addr
            };
        }
        cfg.outbound_capacity = parse_or(&get, "OUTBOUND_CAPACITY", cfg.outbound_capacity);
        cfg.save_capacity = parse_or(&get, "SAVE_CAPACITY", cfg.save_capacity);
        cfg.keepalive_interval = Duration::from_secs(parse_or(
            &get,
            "KEEPALIVE_SECS",
            cfg.keepalive_interval.as_secs(),
        ));
        cfg.save_debounce = Duration::from_millis(parse_or(
            &get,
            "SAVE_DEBOUNCE_MS",
            cfg.save_debounce.as_millis() as u64,
        ));
        if get("ROOM_IDLE_GRACE_SECS").is_some() {
            let secs: u64 = parse_or(&get, "ROOM_IDLE_GRACE_SECS", 60);
            cfg.room_idle_grace = (secs > 0).then(|| Duration::from_secs(secs));
        }
        cfg.shutdown_grace = Duration::from_secs(parse_or(
            &get,
            "SHUTDOWN_GRACE_SECS",
            cfg.shutdown_grace.as_secs(),
        ));
        cfg.handshake_timeout = Duration::from_secs(parse_or(
            &get,
            "HANDSHAKE_TIMEOUT_SECS",
            cfg.handshake_timeout.as_secs(),
        ));
        cfg.publish_timeout = Duration::from_millis(parse_or(
            &get,
            "PUBLISH_TIMEOUT_MS",
            cfg.publish_timeout.as_millis() as u64,
        ));
        if get("STATS_LOG_SECS").is_some() {
            let secs: u64 = parse_or(&get, "STATS_LOG_SECS", 60);
            cfg.stats_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        cfg.storage_path = get("STORAGE_PATH").map(PathBuf::from);
        cfg.redis_url = get("REDIS_URL");
        cfg.rate_limit = RateLimit {
            max: parse_or(&get, "RATE_LIMIT_MAX", cfg.rate_limit.max),
            window: Duration::from_secs(parse_or(
                &get,
                "RATE_LIMIT_WINDOW_SECS",
                cfg.rate_limit.window.as_secs(),
            )),
        };
        if let Some(env) = get("APP_ENV") {
            cfg.env = env;
        }
        cfg
    }

    pub fn is_production(&self) -> bool {
        self.env.eq_ignore_ascii_case("prod")
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.outbound_capacity == 0 || self.save_capacity == 0 {
            return Err(ServerError::Config("queue capacities must be non-zero".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ServerError::Config("keepalive interval must be non-zero".into()));
        }
        if self.handshake_timeout.is_zero() || self.publish_timeout.is_zero() {
            return Err(ServerError::Config("handshake and publish timeouts must be non-zero".into()));
        }
        if self.rate_limit.window.is_zero() {
            return Err(ServerError::Config("rate limit window must be non-zero".into()));
        }
        Ok(())
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            outbound_capacity: self.outbound_capacity,
            save_capacity: self.save_capacity,
            keepalive: self.keepalive_interval,
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            limits: self.connection_limits(),
            save_debounce: self.save_debounce,
            room_idle_grace: self.room_idle_grace,
            publish_timeout: self.publish_timeout,
            stats_interval: self.stats_interval,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("Ignoring unparseable {key}={raw:?}, using default");
                default
            }
        },
        None => default,
    }
}
