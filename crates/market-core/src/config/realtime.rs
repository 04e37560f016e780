//! Real-time change-feed configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Which transport backs the channel manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Hosted change feed over a Phoenix-channels WebSocket.
    #[default]
    Phoenix,
    /// In-process transport (single node, tests, local development).
    Memory,
}

/// Real-time change-feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Transport implementation.
    #[serde(default)]
    pub transport: TransportKind,
    /// Base URL of the hosted project, e.g. `wss://xyz.supabase.co`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Public API key sent as the `apikey` query parameter.
    #[serde(default)]
    pub api_key: String,
    /// Access token forwarded in join payloads for row-level security.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Seconds to wait for a join reply before reporting `TIMED_OUT`.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_seconds: u64,
    /// Reconnect backoff settings.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Location of the messages table in the change feed.
    #[serde(default)]
    pub messages: MessagesTableConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            endpoint: default_endpoint(),
            api_key: String::new(),
            access_token: None,
            heartbeat_interval_seconds: default_heartbeat_interval(),
            join_timeout_seconds: default_join_timeout(),
            backoff: BackoffConfig::default(),
            messages: MessagesTableConfig::default(),
        }
    }
}

impl RealtimeConfig {
    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Join timeout as a [`Duration`].
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_seconds)
    }

    /// Reject settings that would make the manager or transport misbehave.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.backoff.base_delay_ms == 0 {
            return Err(AppError::configuration(
                "realtime.backoff.base_delay_ms must be greater than zero",
            ));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(AppError::configuration(
                "realtime.backoff.max_delay_ms must not be below base_delay_ms",
            ));
        }
        if self.heartbeat_interval_seconds == 0 || self.join_timeout_seconds == 0 {
            return Err(AppError::configuration(
                "realtime heartbeat and join timeouts must be greater than zero",
            ));
        }
        if self.transport == TransportKind::Phoenix && self.api_key.is_empty() {
            return Err(AppError::configuration(
                "realtime.api_key is required for the phoenix transport",
            ));
        }
        Ok(())
    }
}

/// Exponential backoff bounds for channel reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt, in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// Table whose inserts carry chat messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesTableConfig {
    /// Database schema.
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Table name.
    #[serde(default = "default_table")]
    pub table: String,
    /// Column holding the conversation id.
    #[serde(default = "default_conversation_column")]
    pub conversation_column: String,
}

impl Default for MessagesTableConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            table: default_table(),
            conversation_column: default_conversation_column(),
        }
    }
}

fn default_endpoint() -> String {
    "ws://localhost:54321".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_join_timeout() -> u64 {
    10
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_table() -> String {
    "messages".to_string()
}

fn default_conversation_column() -> String {
    "conversation_id".to_string()
}
