//! Phoenix-channels WebSocket transport for the hosted change feed.
//!
//! All channels share one socket, owned by a background task. The handle
//! only forwards join and leave commands, so it never blocks and never
//! calls back into the manager.

pub mod frame;
mod heartbeat;
mod socket;

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use market_core::config::RealtimeConfig;

use crate::channel::types::{ChannelId, ChannelStatus};
use crate::message::types::ChannelEvent;

use super::{ChannelEventSender, ChannelRequest, RealtimeTransport};
use socket::{SocketActor, SocketCommand};

/// Socket settings.
#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Project base URL (`ws`, `wss`, `http` or `https`).
    pub endpoint: String,
    /// Project API key, sent as the `apikey` query parameter.
    pub api_key: String,
    /// User JWT sent with every join.
    pub access_token: Option<String>,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// How long a join (or the socket connect) may take.
    pub join_timeout: Duration,
}

impl PhoenixConfig {
    pub fn from_realtime(config: &RealtimeConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            join_timeout: config.join_timeout(),
        }
    }

    /// Full socket URL.
    pub fn socket_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        let base = if let Some(rest) = endpoint.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = endpoint.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            endpoint.to_string()
        };
        format!("{base}/realtime/v1/websocket?apikey={}&vsn=1.0.0", self.api_key)
    }
}

/// Transport backed by a single Phoenix socket.
///
/// Must be created inside a Tokio runtime. Dropping the last handle closes
/// the socket.
#[derive(Debug)]
pub struct PhoenixTransport {
    commands: mpsc::UnboundedSender<SocketCommand>,
}

impl PhoenixTransport {
    /// Start the socket task. No connection is made until the first channel
    /// is opened.
    pub fn spawn(config: PhoenixConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(SocketActor::new(config, rx).run());
        Self { commands: tx }
    }
}

impl RealtimeTransport for PhoenixTransport {
    fn open_channel(&self, id: ChannelId, request: ChannelRequest, events: ChannelEventSender) {
        let command = SocketCommand::Join {
            id,
            request,
            events: events.clone(),
        };
        if self.commands.send(command).is_err() {
            warn!(channel = %id, "Realtime socket task is gone");
            events.send(ChannelEvent::Status(ChannelStatus::ChannelError));
        }
    }

    fn close_channel(&self, id: ChannelId) {
        let _ = self.commands.send(SocketCommand::Leave { id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> PhoenixConfig {
        PhoenixConfig {
            endpoint: endpoint.into(),
            api_key: "anon-key".into(),
            access_token: None,
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_socket_url_from_https() {
        assert_eq!(
            config("https://abc.supabase.co/").socket_url(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_socket_url_keeps_ws() {
        assert_eq!(
            config("ws://127.0.0.1:54321").socket_url(),
            "ws://127.0.0.1:54321/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_from_realtime() {
        let realtime = RealtimeConfig {
            api_key: "k".into(),
            access_token: Some("jwt".into()),
            ..RealtimeConfig::default()
        };
        let phoenix = PhoenixConfig::from_realtime(&realtime);
        assert_eq!(phoenix.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(phoenix.join_timeout, Duration::from_secs(10));
        assert_eq!(phoenix.access_token.as_deref(), Some("jwt"));
    }
}
