//! Shared test helpers for manager integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use market_core::config::{RealtimeConfig, TransportKind};
use market_realtime::transport::MemoryTransport;
use market_realtime::{
    ChangeRecord, ChannelConnectionManager, ChannelHandlers, ChannelId, ChannelStatus,
    ConversationEvent, RealtimeMetrics,
};

/// Manager wired to an in-memory transport the test drives by hand.
pub struct TestHarness {
    pub manager: ChannelConnectionManager,
    pub transport: Arc<MemoryTransport>,
    pub metrics: Arc<RealtimeMetrics>,
}

impl TestHarness {
    pub fn new() -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let metrics = Arc::new(RealtimeMetrics::new());
        let config = RealtimeConfig {
            transport: TransportKind::Memory,
            ..RealtimeConfig::default()
        };
        let manager = ChannelConnectionManager::new(transport.clone(), &config, metrics.clone())
            .expect("valid config");
        Self {
            manager,
            transport,
            metrics,
        }
    }

    /// Subscribe with channel-backed handlers and return the receiver.
    pub fn subscribe(&self, conversation_id: &str) -> mpsc::UnboundedReceiver<ConversationEvent> {
        let (handlers, rx) = ChannelHandlers::channel(false);
        self.manager
            .subscribe(conversation_id, handlers)
            .expect("subscribe");
        rx
    }

    /// The conversation's current channel.
    pub fn channel(&self, conversation_id: &str) -> ChannelId {
        self.manager
            .current_channel(conversation_id)
            .expect("conversation has an open channel")
    }

    /// Report `status` on the conversation's current channel and let it
    /// propagate.
    pub async fn emit(&self, conversation_id: &str, status: ChannelStatus) {
        let id = self.channel(conversation_id);
        assert!(self.transport.emit_status(id, status), "channel {id} is open");
        settle().await;
    }

    /// Fail the current channel and fire the resulting reconnect timer.
    /// Returns the delay that was scheduled.
    pub async fn fail_and_reconnect(&self, conversation_id: &str) -> u64 {
        self.emit(conversation_id, ChannelStatus::ChannelError).await;
        let delay = self
            .manager
            .pending_retry_delay(conversation_id)
            .expect("reconnect scheduled");
        tokio::time::advance(delay).await;
        settle().await;
        delay.as_millis() as u64
    }
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// A message row for `conversation_id`.
pub fn message(conversation_id: &str, body: &str) -> ChangeRecord {
    let Value::Object(row) = json!({
        "id": 1,
        "conversation_id": conversation_id,
        "sender_id": "buyer-7",
        "body": body,
    }) else {
        unreachable!()
    };
    ChangeRecord::new("public", "messages", row)
}

/// Everything received so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Bodies of the messages in `events`.
pub fn bodies(events: &[ConversationEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ConversationEvent::Message(record) => record.column_text("body"),
            _ => None,
        })
        .collect()
}

/// Statuses in `events`.
pub fn statuses(events: &[ConversationEvent]) -> Vec<ChannelStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            ConversationEvent::Status(status) => Some(status.clone()),
            _ => None,
        })
        .collect()
}
