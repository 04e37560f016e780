//! Channel manager metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters updated by the channel manager.
#[derive(Debug, Default)]
pub struct RealtimeMetrics {
    /// Channels opened (initial subscribes and reconnects)
    pub channels_opened: AtomicU64,
    /// Channels closed
    pub channels_closed: AtomicU64,
    /// Reconnect timers scheduled
    pub reconnects_scheduled: AtomicU64,
    /// Reconnect timers that fired and reopened a channel
    pub reconnect_attempts: AtomicU64,
    /// Status events forwarded to handlers
    pub status_events: AtomicU64,
    /// Message rows delivered to handlers
    pub messages_delivered: AtomicU64,
    /// Presence syncs delivered to handlers
    pub presence_syncs: AtomicU64,
    /// Events dropped because their channel was no longer current
    pub late_events_dropped: AtomicU64,
}

impl RealtimeMetrics {
    /// Create new zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn channel_closed(&self) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_attempted(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn status_forwarded(&self) {
        self.status_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn presence_synced(&self) {
        self.presence_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn late_event_dropped(&self) {
        self.late_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            status_events: self.status_events.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            presence_syncs: self.presence_syncs.load(Ordering::Relaxed),
            late_events_dropped: self.late_events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Channels opened
    pub channels_opened: u64,
    /// Channels closed
    pub channels_closed: u64,
    /// Reconnect timers scheduled
    pub reconnects_scheduled: u64,
    /// Reconnect timers that fired
    pub reconnect_attempts: u64,
    /// Status events forwarded
    pub status_events: u64,
    /// Message rows delivered
    pub messages_delivered: u64,
    /// Presence syncs delivered
    pub presence_syncs: u64,
    /// Late events dropped
    pub late_events_dropped: u64,
}

impl MetricsSnapshot {
    /// Channels opened and not yet closed.
    pub fn open_channels(&self) -> u64 {
        self.channels_opened.saturating_sub(self.channels_closed)
    }
}
