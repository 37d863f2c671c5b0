//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SUPPORT_SESSION_URL`,
//!    `SUPPORT_SESSION_OFFICE_ID`, `SUPPORT_SESSION_LOG`
//! 2. **Config file**: path via `--config <path>`, or `support-session.toml`
//!    in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [backend]
//! url = "https://backoffice.example.com"
//! office_id = "office-1"          # optional
//! creation = "event"              # "event" | "rest"
//!
//! [connection]
//! connect_timeout_ms = 10000
//! reconnect_interval_ms = 5000
//! max_reconnect_attempts = 5
//! heartbeat_interval_secs = 30
//! prefer_websocket = true         # false = long-polling only
//!
//! [session]
//! send_ack_timeout_ms = 15000
//! request_ack_timeout_ms = 10000
//! duplicate_window_ms = 3000
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::ConnectionSettings;
use crate::error::ChatError;
use crate::session::SessionSettings;
use crate::transport::{normalize_origin, TransportOptions};

const DEFAULT_CONFIG_FILE: &str = "support-session.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which path creates conversations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreationMode {
    /// `createConversation` socket event.
    #[default]
    Event,
    /// `POST /chat/start-chat`.
    Rest,
}

/// Chat backend location and identity.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend origin, `http://` or `https://`. Override with `SUPPORT_SESSION_URL`.
    #[serde(default = "default_url")]
    pub url: String,
    /// Office the user belongs to; sent with join/list/create when set.
    /// Override with `SUPPORT_SESSION_OFFICE_ID`.
    #[serde(default)]
    pub office_id: Option<String>,
    #[serde(default)]
    pub creation: CreationMode,
}

/// Transport and reconnect tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Connect timeout per transport attempt (default 10 000 ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Fixed delay between reconnect attempts (default 5 000 ms).
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Attempts before giving up (default 5).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Seconds between `checkConnection` probes (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Try WebSocket before long-polling (default true).
    #[serde(default = "default_prefer_websocket")]
    pub prefer_websocket: bool,
}

/// Acknowledgement and dedup tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Ack bound for `clientMessage` (default 15 000 ms).
    #[serde(default = "default_send_ack_timeout_ms")]
    pub send_ack_timeout_ms: u64,
    /// Ack bound for `joinChat`, `createConversation`, `checkConnection` (default 10 000 ms).
    #[serde(default = "default_request_ack_timeout_ms")]
    pub request_ack_timeout_ms: u64,
    /// Same sender + same text within this window counts as a duplicate (default 3 000 ms).
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_interval_ms() -> u64 {
    5_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_prefer_websocket() -> bool {
    true
}
fn default_send_ack_timeout_ms() -> u64 {
    15_000
}
fn default_request_ack_timeout_ms() -> u64 {
    10_000
}
fn default_duplicate_window_ms() -> u64 {
    3_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            office_id: None,
            creation: CreationMode::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            prefer_websocket: default_prefer_websocket(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_ack_timeout_ms: default_send_ack_timeout_ms(),
            request_ack_timeout_ms: default_request_ack_timeout_ms(),
            duplicate_window_ms: default_duplicate_window_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise
    /// `support-session.toml` in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ChatError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document (no env overrides, no validation).
    pub fn from_toml(content: &str) -> Result<Self, ChatError> {
        toml::from_str(content).map_err(|e| ChatError::Config(e.to_string()))
    }

    fn from_file(path: &str) -> Result<Self, ChatError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("Failed to read config file {path}: {e}")))?;
        Self::from_toml(&content)
            .map_err(|e| ChatError::Config(format!("Failed to parse config file {path}: {e}")))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("SUPPORT_SESSION_URL") {
            self.backend.url = url;
        }
        if let Some(office) = var("SUPPORT_SESSION_OFFICE_ID") {
            self.backend.office_id = Some(office).filter(|o| !o.is_empty());
        }
        if let Some(level) = var("SUPPORT_SESSION_LOG") {
            self.logging.level = level;
        }
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.backend.url.trim().is_empty() {
            return Err(ChatError::Config("backend.url must not be empty".into()));
        }
        normalize_origin(&self.backend.url)?;
        let c = &self.connection;
        for (name, value) in [
            ("connection.connect_timeout_ms", c.connect_timeout_ms),
            ("connection.reconnect_interval_ms", c.reconnect_interval_ms),
            ("connection.heartbeat_interval_secs", c.heartbeat_interval_secs),
            ("session.send_ack_timeout_ms", self.session.send_ack_timeout_ms),
            ("session.request_ack_timeout_ms", self.session.request_ack_timeout_ms),
        ] {
            if value == 0 {
                return Err(ChatError::Config(format!("{name} must be greater than 0")));
            }
        }
        if c.max_reconnect_attempts == 0 {
            return Err(ChatError::Config(
                "connection.max_reconnect_attempts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            origin: self.backend.url.clone(),
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            prefer_websocket: self.connection.prefer_websocket,
        }
    }

    pub fn session_settings(&self, user_id: &str) -> SessionSettings {
        SessionSettings {
            user_id: user_id.to_string(),
            office_id: self.backend.office_id.clone(),
            send_ack_timeout: Duration::from_millis(self.session.send_ack_timeout_ms),
            request_ack_timeout: Duration::from_millis(self.session.request_ack_timeout_ms),
            duplicate_window: Duration::from_millis(self.session.duplicate_window_ms),
            connection: ConnectionSettings {
                reconnect_interval: Duration::from_millis(self.connection.reconnect_interval_ms),
                max_reconnect_attempts: self.connection.max_reconnect_attempts,
                heartbeat_interval: Duration::from_secs(self.connection.heartbeat_interval_secs),
            },
        }
    }
}
