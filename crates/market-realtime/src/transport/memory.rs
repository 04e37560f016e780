//! In-memory transport for single-node deployments and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::channel::types::{ChannelId, ChannelStatus};
use crate::message::presence::PresenceState;
use crate::message::types::{ChangeRecord, ChannelEvent};

use super::{ChannelEventSender, ChannelRequest, RealtimeTransport};

/// One open in-memory channel.
#[derive(Debug)]
struct MemoryChannel {
    request: ChannelRequest,
    sender: ChannelEventSender,
}

/// In-process transport.
///
/// Inserts are published with [`MemoryTransport::publish_insert`] and routed
/// to every open channel whose filter matches. Statuses and presence can be
/// injected per channel, which makes this the transport used to drive the
/// manager in tests.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    /// Channel ID → open channel.
    channels: DashMap<ChannelId, MemoryChannel>,
    /// Acknowledge every open with `SUBSCRIBED`.
    auto_subscribe: bool,
    /// Total `open_channel` calls.
    opened: AtomicU64,
    /// Total `close_channel` calls that released an open channel.
    closed: AtomicU64,
}

impl MemoryTransport {
    /// Create a transport that leaves status reporting to the caller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that reports `SUBSCRIBED` as soon as a channel opens.
    pub fn auto_subscribing() -> Self {
        Self {
            auto_subscribe: true,
            ..Self::default()
        }
    }

    /// Deliver an inserted row to every matching open channel.
    ///
    /// Returns the number of channels it was delivered to.
    pub fn publish_insert(&self, record: ChangeRecord) -> usize {
        let mut delivered = 0;
        for entry in self.channels.iter() {
            if entry.request.changes.matches(&record)
                && entry.sender.send(ChannelEvent::Insert(record.clone()))
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Report a status on one channel. Returns `false` if it is not open.
    pub fn emit_status(&self, id: ChannelId, status: ChannelStatus) -> bool {
        self.emit(id, ChannelEvent::Status(status))
    }

    /// Report a presence sync on one channel. Returns `false` if it is not open.
    pub fn set_presence(&self, id: ChannelId, state: PresenceState) -> bool {
        self.emit(id, ChannelEvent::PresenceSync(state))
    }

    fn emit(&self, id: ChannelId, event: ChannelEvent) -> bool {
        self.channels
            .get(&id)
            .map(|ch| ch.sender.send(event))
            .unwrap_or(false)
    }

    /// Whether a channel is currently open.
    pub fn is_open(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    /// Currently open channel ids, ascending.
    pub fn open_channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Open channels listening on `topic`, ascending.
    pub fn channels_for_topic(&self, topic: &str) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|e| e.request.topic == topic)
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    /// The request a channel was opened with.
    pub fn request(&self, id: ChannelId) -> Option<ChannelRequest> {
        self.channels.get(&id).map(|ch| ch.request.clone())
    }

    /// Total channels ever opened.
    pub fn opened_count(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Total channels ever closed.
    pub fn closed_count(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Channels currently open.
    pub fn open_count(&self) -> usize {
        self.channels.len()
    }
}

impl RealtimeTransport for MemoryTransport {
    fn open_channel(&self, id: ChannelId, request: ChannelRequest, events: ChannelEventSender) {
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(channel_id = %id, topic = %request.topic, "Memory channel opened");

        if self.auto_subscribe {
            events.send(ChannelEvent::Status(ChannelStatus::Subscribed));
        }
        self.channels.insert(
            id,
            MemoryChannel {
                request,
                sender: events,
            },
        );
    }

    fn close_channel(&self, id: ChannelId) {
        if self.channels.remove(&id).is_some() {
            self.closed.fetch_add(1, Ordering::Relaxed);
            debug!(channel_id = %id, "Memory channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChangeEvent, PostgresChangesFilter};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn request(conversation: &str) -> ChannelRequest {
        ChannelRequest {
            topic: format!("messages:{conversation}"),
            changes: PostgresChangesFilter {
                event: ChangeEvent::Insert,
                schema: "public".into(),
                table: "messages".into(),
                column: "conversation_id".into(),
                value: conversation.into(),
            },
            presence: None,
        }
    }

    fn row(conversation: &str) -> ChangeRecord {
        let serde_json::Value::Object(map) = json!({ "conversation_id": conversation, "body": "hi" })
        else {
            unreachable!()
        };
        ChangeRecord::new("public", "messages", map)
    }

    #[test]
    fn test_publish_routes_by_filter() {
        let transport = MemoryTransport::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        transport.open_channel(ChannelId(1), request("a"), ChannelEventSender::new(ChannelId(1), tx1));
        transport.open_channel(ChannelId(2), request("b"), ChannelEventSender::new(ChannelId(2), tx2));

        assert_eq!(transport.publish_insert(row("a")), 1);
        assert!(matches!(rx1.try_recv(), Ok(ChannelEvent::Insert(_))));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_auto_subscribe_and_counts() {
        let transport = MemoryTransport::auto_subscribing();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open_channel(ChannelId(7), request("a"), ChannelEventSender::new(ChannelId(7), tx));

        assert_eq!(
            rx.try_recv().ok(),
            Some(ChannelEvent::Status(ChannelStatus::Subscribed))
        );
        assert_eq!(transport.channels_for_topic("messages:a"), vec![ChannelId(7)]);

        transport.close_channel(ChannelId(7));
        transport.close_channel(ChannelId(7));
        assert_eq!(transport.opened_count(), 1);
        assert_eq!(transport.closed_count(), 1);
        assert!(!transport.emit_status(ChannelId(7), ChannelStatus::Closed));
    }
}
