//! Channel identifiers, transport statuses, and connection states.

use std::fmt;

use serde::{Deserialize, Serialize};

use market_core::types::ConversationId;

/// Process-unique identifier of one opened channel.
///
/// A fresh id is allocated for every open, including reconnects, so events
/// from a replaced channel can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Subscription status reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    /// The channel is joined; messages will now be delivered.
    Subscribed,
    /// The server rejected or errored the channel.
    ChannelError,
    /// The join or the socket heartbeat timed out.
    TimedOut,
    /// The channel was closed by the server or the socket went away.
    Closed,
    /// Any other status, forwarded verbatim.
    Other(String),
}

impl ChannelStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribed => "SUBSCRIBED",
            Self::ChannelError => "CHANNEL_ERROR",
            Self::TimedOut => "TIMED_OUT",
            Self::Closed => "CLOSED",
            Self::Other(s) => s,
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Self {
        match s {
            "SUBSCRIBED" => Self::Subscribed,
            "CHANNEL_ERROR" => Self::ChannelError,
            "TIMED_OUT" => Self::TimedOut,
            "CLOSED" => Self::Closed,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this status triggers a reconnect.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ChannelError | Self::TimedOut | Self::Closed)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// A channel has been opened and is waiting for `SUBSCRIBED`.
    Connecting,
    /// The last observed status was `SUBSCRIBED`.
    Connected,
    /// Nothing open, or the last observed status was a failure.
    #[default]
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Receipt returned by `subscribe`.
///
/// It identifies the subscription but grants no access to the underlying
/// transport channel, which stays owned by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    conversation_id: ConversationId,
    channel_id: ChannelId,
}

impl SubscriptionHandle {
    pub(crate) fn new(conversation_id: ConversationId, channel_id: ChannelId) -> Self {
        Self {
            conversation_id,
            channel_id,
        }
    }

    /// The conversation this subscription follows.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// The channel opened by the `subscribe` call.
    ///
    /// Reconnects open new channels, so this only identifies the first one.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }
}
