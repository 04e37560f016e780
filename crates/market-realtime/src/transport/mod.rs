//! Publish/subscribe transports the channel manager runs on.
//!
//! A transport opens named channels against a change feed and pushes
//! [`ChannelEvent`]s for each channel into the sender it was given. It never
//! reports failures synchronously: a channel that cannot be joined produces
//! a failure status instead.

pub mod memory;
pub mod phoenix;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::channel::types::ChannelId;
use crate::message::types::{ChangeRecord, ChannelEvent};

pub use memory::MemoryTransport;
pub use phoenix::PhoenixTransport;

/// A change-feed transport.
///
/// Implementations must not call back into the channel manager from
/// `open_channel` or `close_channel`; both are invoked while the manager's
/// registry lock is held.
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Open a channel. Events for it are pushed into `events`.
    fn open_channel(&self, id: ChannelId, request: ChannelRequest, events: ChannelEventSender);

    /// Release a channel. Unknown ids are ignored.
    fn close_channel(&self, id: ChannelId);
}

/// What a channel listens to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    /// Logical channel name, e.g. `messages:conv-1`.
    pub topic: String,
    /// Row-change subscription.
    pub changes: PostgresChangesFilter,
    /// Presence tracking, if the caller wants presence syncs.
    pub presence: Option<PresenceConfig>,
}

/// Kind of row change to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// Row inserts.
    #[serde(rename = "INSERT")]
    Insert,
}

impl ChangeEvent {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
        }
    }
}

/// Equality filter on one column of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresChangesFilter {
    /// Change kind.
    pub event: ChangeEvent,
    /// Schema name.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Filtered column.
    pub column: String,
    /// Required column value.
    pub value: String,
}

impl PostgresChangesFilter {
    /// The filter expression in the feed's syntax (`column=eq.value`).
    pub fn expression(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }

    /// Whether a record satisfies this filter.
    pub fn matches(&self, record: &ChangeRecord) -> bool {
        record.schema == self.schema
            && record.table == self.table
            && record.column_text(&self.column).as_deref() == Some(self.value.as_str())
    }
}

/// Presence options for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Key this client is tracked under. Empty lets the server choose.
    pub key: String,
}

/// Sending half of one channel's event stream.
#[derive(Debug, Clone)]
pub struct ChannelEventSender {
    id: ChannelId,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelEventSender {
    /// Wrap a sender for channel `id`.
    pub fn new(id: ChannelId, tx: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self { id, tx }
    }

    /// The channel this sender belongs to.
    pub fn channel_id(&self) -> ChannelId {
        self.id
    }

    /// Push an event. Returns `false` once the manager stopped listening.
    pub fn send(&self, event: ChannelEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}
