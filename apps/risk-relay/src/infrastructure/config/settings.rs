//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::DEFAULT_HISTORY_LIMIT;
use crate::domain::market::UserId;
use crate::infrastructure::heartbeat::KeepAliveConfig;

const DEFAULT_ADDR: &str = "0.0.0.0:9113";
const DEFAULT_UPSTREAM_URL: &str = "ws://localhost:9111/";
const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "test";
const DEFAULT_DATA_DIR: &str = "store";
const DEFAULT_PYTHON: &str = "python3";
const DEFAULT_RECOMPUTE_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_REQUEST_QUEUE: usize = 1024;

/// Upstream login credentials.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Get the username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Get the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP/WebSocket bind address.
    pub addr: SocketAddr,
    /// Upstream trading server WebSocket URL.
    pub upstream_url: String,
    /// Upstream login.
    pub credentials: Credentials,
    /// Root of the per-user file store.
    pub data_dir: PathBuf,
    /// Interpreter for script call-outs.
    pub python: String,
    /// User whose sessions receive unrecognized upstream frames.
    pub admin_user_id: Option<UserId>,
    /// Keep-alive timing for both transports.
    pub keepalive: KeepAliveConfig,
    /// Recompute period.
    pub recompute_interval: Duration,
    /// Points kept per graph-enabled param.
    pub history_limit: usize,
    /// Capacity of the shared viewer-to-upstream queue.
    pub request_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9113)),
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            credentials: Credentials::new(
                DEFAULT_USERNAME.to_string(),
                DEFAULT_PASSWORD.to_string(),
            ),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            python: DEFAULT_PYTHON.to_string(),
            admin_user_id: None,
            keepalive: KeepAliveConfig::default(),
            recompute_interval: DEFAULT_RECOMPUTE_INTERVAL,
            history_limit: DEFAULT_HISTORY_LIMIT,
            request_queue: DEFAULT_REQUEST_QUEUE,
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is empty where one is required, or
    /// cannot be parsed where no fallback exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`RelayConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr_text = lookup("RISK_RELAY_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = addr_text
            .parse()
            .map_err(|_| ConfigError::InvalidValue("RISK_RELAY_ADDR".to_string(), addr_text))?;

        let username =
            lookup("RISK_RELAY_USERNAME").unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        if username.is_empty() {
            return Err(ConfigError::EmptyValue("RISK_RELAY_USERNAME".to_string()));
        }
        let password =
            lookup("RISK_RELAY_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.to_string());

        let upstream_url =
            lookup("RISK_RELAY_UPSTREAM_URL").unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
        if upstream_url.is_empty() {
            return Err(ConfigError::EmptyValue("RISK_RELAY_UPSTREAM_URL".to_string()));
        }

        let admin_user_id = match lookup("RISK_RELAY_ADMIN_USER_ID").filter(|v| !v.is_empty()) {
            Some(v) => Some(v.parse().map_err(|_| {
                ConfigError::InvalidValue("RISK_RELAY_ADMIN_USER_ID".to_string(), v)
            })?),
            None => None,
        };

        let defaults = Self::default();
        let keepalive = KeepAliveConfig::new(
            parse_duration_secs(
                &lookup,
                "RISK_RELAY_WRITE_WAIT_SECS",
                defaults.keepalive.write_wait,
            ),
            parse_duration_secs(&lookup, "RISK_RELAY_PONG_WAIT_SECS", defaults.keepalive.pong_wait),
        );

        Ok(Self {
            addr,
            upstream_url,
            credentials: Credentials::new(username, password),
            data_dir: lookup("RISK_RELAY_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            python: lookup("RISK_RELAY_PYTHON").unwrap_or(defaults.python),
            admin_user_id,
            keepalive,
            recompute_interval: parse_duration_millis(
                &lookup,
                "RISK_RELAY_RECOMPUTE_INTERVAL_MS",
                defaults.recompute_interval,
            ),
            history_limit: parse_usize(&lookup, "RISK_RELAY_HISTORY_LIMIT", defaults.history_limit),
            request_queue: parse_usize(&lookup, "RISK_RELAY_REQUEST_QUEUE", defaults.request_queue)
                .max(1),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {0} has invalid value '{1}'")]
    InvalidValue(String, String),
}

fn parse_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map_or(default, Duration::from_millis)
}
