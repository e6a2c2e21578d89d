use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default ack batch size in bytes.
pub const DEFAULT_ACK_BATCH_SIZE: usize = 1024 * 1024;
/// Default consumer window size in bytes.
pub const DEFAULT_CONSUMER_WINDOW_SIZE: i32 = 1024 * 1024;
/// Default producer window size in bytes.
pub const DEFAULT_PRODUCER_WINDOW_SIZE: i32 = 64 * 1024;
/// Default threshold above which a message is sent as a large message.
pub const DEFAULT_MIN_LARGE_MESSAGE_SIZE: usize = 100 * 1024;
/// Default initial encode buffer for new messages.
pub const DEFAULT_INITIAL_MESSAGE_PACKET_SIZE: usize = 1500;

/// Top-level configuration, normally loaded from `lumen.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LumenConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub credits: CreditConfig,
    #[serde(default)]
    pub resource_manager: ResourceManagerConfig,
}

/// Per-session acknowledgement, windowing and transaction options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Session participates in XA transactions.
    pub xa: bool,
    /// Sends are committed automatically (false = transacted sends).
    pub auto_commit_sends: bool,
    /// Acknowledgements are committed automatically (false = transacted acks).
    pub auto_commit_acks: bool,
    /// Messages are acknowledged by the broker before delivery.
    pub pre_acknowledge: bool,
    /// Acknowledgements block until the broker confirms them.
    pub block_on_acknowledge: bool,
    pub block_on_durable_send: bool,
    pub block_on_non_durable_send: bool,
    pub auto_group: bool,
    pub group_id: Option<String>,
    /// Bytes of acknowledgements batched before they are flushed.
    pub ack_batch_size: usize,
    /// Consumer flow-control window in bytes (-1 = unbounded, 0 = no buffering).
    pub consumer_window_size: i32,
    /// Max messages/second per consumer (-1 = unlimited).
    pub consumer_max_rate: i32,
    /// Producer flow-control window in bytes (-1 = unbounded, 0 = disabled).
    pub producer_window_size: i32,
    /// Max messages/second per producer (-1 = unlimited).
    pub producer_max_rate: i32,
    pub min_large_message_size: usize,
    pub compress_large_messages: bool,
    pub initial_message_packet_size: usize,
    /// Send-confirmation window (-1 = disabled).
    pub confirmation_window_size: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            xa: false,
            auto_commit_sends: true,
            auto_commit_acks: true,
            pre_acknowledge: false,
            block_on_acknowledge: false,
            block_on_durable_send: true,
            block_on_non_durable_send: false,
            auto_group: false,
            group_id: None,
            ack_batch_size: DEFAULT_ACK_BATCH_SIZE,
            consumer_window_size: DEFAULT_CONSUMER_WINDOW_SIZE,
            consumer_max_rate: -1,
            producer_window_size: DEFAULT_PRODUCER_WINDOW_SIZE,
            producer_max_rate: -1,
            min_large_message_size: DEFAULT_MIN_LARGE_MESSAGE_SIZE,
            compress_large_messages: false,
            initial_message_packet_size: DEFAULT_INITIAL_MESSAGE_PACKET_SIZE,
            confirmation_window_size: -1,
        }
    }
}

impl SessionConfig {
    /// A transacted (manual commit) session.
    pub fn transacted() -> Self {
        Self {
            auto_commit_sends: false,
            auto_commit_acks: false,
            ..Self::default()
        }
    }

    /// An XA session: both sends and acks are driven by the external
    /// transaction manager.
    pub fn xa() -> Self {
        Self {
            xa: true,
            auto_commit_sends: false,
            auto_commit_acks: false,
            ..Self::default()
        }
    }
}

/// Producer credit flow-control settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CreditConfig {
    /// Maximum time a send waits for credits before failing (ms).
    pub max_wait_ms: u64,
    /// Released, unreferenced credit holders cached for reuse.
    pub max_unreferenced_credits: usize,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 10_000,
            max_unreferenced_credits: 1000,
        }
    }
}

/// Broker-side resource manager settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// Timeout for transactions that do not carry their own.
    pub default_timeout_secs: u64,
    /// Period of the timeout reaper.
    pub scan_period_ms: u64,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            scan_period_ms: 1000,
        }
    }
}

impl LumenConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: LumenConfig =
            toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)?;
                tracing::info!(path = %path.display(), "loaded config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        if s.consumer_window_size < -1 {
            return Err(ConfigError::Invalid(format!(
                "session.consumer_window_size must be >= -1, got {}",
                s.consumer_window_size
            )));
        }
        if s.producer_window_size < -1 {
            return Err(ConfigError::Invalid(format!(
                "session.producer_window_size must be >= -1, got {}",
                s.producer_window_size
            )));
        }
        if s.ack_batch_size == 0 {
            return Err(ConfigError::Invalid("session.ack_batch_size must be > 0".into()));
        }
        if s.xa && (s.auto_commit_sends || s.auto_commit_acks) {
            tracing::warn!("XA session configured with auto-commit; the transaction manager owns completion");
        }
        if self.resource_manager.scan_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "resource_manager.scan_period_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}
