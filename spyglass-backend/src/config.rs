use std::env::var;
use std::time::Duration;

use dotenvy::dotenv;
use tracing::warn;

const DAY_SECS: u64 = 86_400;

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Ingress port for the health check and push-channel attach point
    /// Env: PORT (default: 3000)
    pub port: u16,

    /// Database file path
    /// Env: DATABASE_PATH (default: "spyglass.db")
    pub database_path: String,

    /// Directory for pre-optimization snapshots
    /// Env: BACKUP_DIR (default: "backups")
    pub backup_dir: String,

    /// Probe tick period
    /// Env: MONITOR_INTERVAL_SECS (default: 10, floor: 5)
    pub monitor_interval: Duration,

    /// Per-probe wall-clock budget
    /// Env: PING_TIMEOUT_SECS (default: 30, cap: 30)
    pub ping_timeout: Duration,

    /// Probe worker-pool size
    /// Env: MAX_CONCURRENT (default: 10)
    pub max_concurrent: usize,

    /// Horizon for light sample pruning
    /// Env: SAMPLE_TTL_DAYS (default: 30)
    pub sample_ttl: Duration,

    /// Horizon for activity pruning
    /// Env: ACTIVITY_TTL_DAYS (default: 180)
    pub activity_ttl: Duration,

    /// Horizon for closed-session pruning
    /// Env: SESSION_TTL_DAYS (default: 365)
    pub session_ttl: Duration,

    /// Depth of the hub broadcast channel
    /// Env: BROADCAST_BUFFER (default: 1000, floor: 1000)
    pub broadcast_buffer: usize,

    /// Per-subscriber outbound queue depth
    /// Env: CLIENT_BUFFER (default: 256)
    pub client_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let _ = dotenv(); //for debugging mostly
        let mut config = Self {
            port: env_or_default("PORT", 3000),
            database_path: env_or_default_string("DATABASE_PATH", "spyglass.db"),
            backup_dir: env_or_default_string("BACKUP_DIR", "backups"),
            monitor_interval: Duration::from_secs(env_or_default("MONITOR_INTERVAL_SECS", 10)),
            ping_timeout: Duration::from_secs(env_or_default("PING_TIMEOUT_SECS", 30)),
            max_concurrent: env_or_default("MAX_CONCURRENT", 10),
            sample_ttl: Duration::from_secs(env_or_default("SAMPLE_TTL_DAYS", 30) * DAY_SECS),
            activity_ttl: Duration::from_secs(env_or_default("ACTIVITY_TTL_DAYS", 180) * DAY_SECS),
            session_ttl: Duration::from_secs(env_or_default("SESSION_TTL_DAYS", 365) * DAY_SECS),
            broadcast_buffer: env_or_default("BROADCAST_BUFFER", 1000),
            client_buffer: env_or_default("CLIENT_BUFFER", 256),
        };
        config.validate();
        config
    }

    /// Create configuration with all default values
    pub fn default() -> Self {
        Self {
            port: 3000,
            database_path: "spyglass.db".to_string(),
            backup_dir: "backups".to_string(),
            monitor_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(30),
            max_concurrent: 10,
            sample_ttl: Duration::from_secs(30 * DAY_SECS),
            activity_ttl: Duration::from_secs(180 * DAY_SECS),
            session_ttl: Duration::from_secs(365 * DAY_SECS),
            broadcast_buffer: 1000,
            client_buffer: 256,
        }
    }

    /// Clamp values that would destabilize the probe loop or the hub.
    fn validate(&mut self) {
        if self.monitor_interval < Duration::from_secs(5) {
            warn!("monitor interval too short, raising to 5s");
            self.monitor_interval = Duration::from_secs(5);
        }
        if self.ping_timeout > Duration::from_secs(30) {
            warn!("ping timeout too long, capping at 30s");
            self.ping_timeout = Duration::from_secs(30);
        }
        if self.max_concurrent == 0 {
            self.max_concurrent = 1;
        }
        if self.broadcast_buffer < 1000 {
            self.broadcast_buffer = 1000;
        }
        if self.client_buffer == 0 {
            self.client_buffer = 1;
        }
    }
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}
