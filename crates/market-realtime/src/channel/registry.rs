//! Registry of conversation subscriptions.
//!
//! Holds at most one registration per conversation, and each registration
//! holds at most one live channel and at most one pending retry timer. The
//! registry is only ever touched behind the manager's mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use market_core::types::ConversationId;

use super::gate::DeliveryGate;
use super::handlers::ChannelHandlers;
use super::types::{ChannelId, ConnectionState};

/// An open transport channel owned by a registration.
#[derive(Debug)]
pub(crate) struct LiveChannel {
    /// Channel id given to the transport.
    pub id: ChannelId,
    /// Task forwarding the channel's events to the manager.
    pub pump: JoinHandle<()>,
    /// Guards handler calls for this channel; closed on teardown.
    pub gate: Arc<DeliveryGate>,
}

/// A scheduled reconnect.
#[derive(Debug)]
pub(crate) struct PendingRetry {
    /// Identifies this timer; a timer that finds a different token is stale.
    pub token: u64,
    /// Delay the timer was scheduled with.
    pub delay: Duration,
    /// Sleeping task that performs the reconnect.
    pub task: JoinHandle<()>,
}

/// Stored handlers and retry state for one conversation.
#[derive(Debug)]
pub(crate) struct Registration {
    pub conversation_id: ConversationId,
    pub handlers: ChannelHandlers,
    pub retry_count: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub state: ConnectionState,
    pub channel: Option<LiveChannel>,
    pub retry: Option<PendingRetry>,
}

impl Registration {
    /// Fresh registration with no channel and zero retries.
    pub fn new(conversation_id: ConversationId, handlers: ChannelHandlers) -> Self {
        Self {
            conversation_id,
            handlers,
            retry_count: 0,
            last_connected_at: None,
            state: ConnectionState::Disconnected,
            channel: None,
            retry: None,
        }
    }

    /// Whether `channel_id` is the channel this registration currently owns.
    pub fn is_current(&self, channel_id: ChannelId) -> bool {
        self.channel.as_ref().is_some_and(|ch| ch.id == channel_id)
    }
}

/// Conversation ID → registration, plus the process-wide connection state.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: HashMap<ConversationId, Registration>,
    /// Last status observed on any channel.
    pub connection_state: ConnectionState,
}

impl Registry {
    pub fn insert(&mut self, registration: Registration) {
        self.entries
            .insert(registration.conversation_id.clone(), registration);
    }

    pub fn remove(&mut self, id: &ConversationId) -> Option<Registration> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Registration> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Registration> {
        self.entries.get_mut(id)
    }

    /// The registration for `id`, only if `channel_id` is its current channel.
    pub fn current_mut(
        &mut self,
        id: &ConversationId,
        channel_id: ChannelId,
    ) -> Option<&mut Registration> {
        self.entries
            .get_mut(id)
            .filter(|reg| reg.is_current(channel_id))
    }

    pub fn current(&self, id: &ConversationId, channel_id: ChannelId) -> Option<&Registration> {
        self.entries.get(id).filter(|reg| reg.is_current(channel_id))
    }

    /// Remove and return every registration.
    pub fn drain(&mut self) -> Vec<Registration> {
        self.entries.drain().map(|(_, reg)| reg).collect()
    }

    /// Number of registrations with an open channel.
    pub fn channel_count(&self) -> usize {
        self.entries
            .values()
            .filter(|reg| reg.channel.is_some())
            .count()
    }

    /// Number of registrations, with or without a channel.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
