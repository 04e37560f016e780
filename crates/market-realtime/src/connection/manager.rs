//! Channel connection manager: one supervised change-feed channel per
//! conversation, with automatic reconnect.
//!
//! Every registry mutation (subscribe, unsubscribe, reconnect, teardown)
//! happens behind a single mutex guarding the whole map, so the
//! at-most-one-channel and at-most-one-timer guarantees hold on a
//! multi-threaded runtime. Handlers are always invoked after the lock is
//! released, inside the channel's delivery gate: tearing a channel down
//! closes its gate, and `subscribe`, `unsubscribe` and `disconnect_all` wait
//! for a callback already running on another thread before returning.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use market_core::config::{MessagesTableConfig, RealtimeConfig};
use market_core::result::AppResult;
use market_core::types::ConversationId;

use crate::channel::gate::DeliveryGate;
use crate::channel::handlers::ChannelHandlers;
use crate::channel::registry::{LiveChannel, PendingRetry, Registration, Registry};
use crate::channel::types::{ChannelId, ChannelStatus, ConnectionState, SubscriptionHandle};
use crate::message::presence::PresenceState;
use crate::message::types::{ChangeRecord, ChannelEvent};
use crate::metrics::RealtimeMetrics;
use crate::transport::{
    ChangeEvent, ChannelEventSender, ChannelRequest, PostgresChangesFilter, PresenceConfig,
    RealtimeTransport,
};

use super::backoff::Backoff;

/// Supervises one change-feed channel per conversation.
///
/// Construct it once at startup and call [`disconnect_all`] on shutdown or
/// logout. Cloning is cheap; clones share the same registry.
///
/// Transport failures never surface as errors: they are reported to the
/// conversation's status handler and answered with a reconnect. The only
/// errors returned are for caller misuse.
///
/// All methods that open channels spawn Tokio tasks and must be called from
/// within a Tokio runtime.
///
/// [`disconnect_all`]: ChannelConnectionManager::disconnect_all
#[derive(Clone)]
pub struct ChannelConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn RealtimeTransport>,
    registry: Mutex<Registry>,
    backoff: Backoff,
    messages: MessagesTableConfig,
    metrics: Arc<RealtimeMetrics>,
    next_channel_id: AtomicU64,
    next_retry_token: AtomicU64,
}

impl fmt::Debug for ChannelConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnectionManager")
            .field("active_channels", &self.active_channel_count())
            .field("backoff", &self.inner.backoff)
            .finish_non_exhaustive()
    }
}

impl ChannelConnectionManager {
    /// Creates a manager on top of `transport`.
    ///
    /// Fails with a configuration error if `config` does not validate.
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        config: &RealtimeConfig,
        metrics: Arc<RealtimeMetrics>,
    ) -> AppResult<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(ManagerInner {
                transport,
                registry: Mutex::new(Registry::default()),
                backoff: Backoff::from(config.backoff),
                messages: config.messages.clone(),
                metrics,
                next_channel_id: AtomicU64::new(1),
                next_retry_token: AtomicU64::new(1),
            }),
        })
    }

    /// Subscribes to new messages in a conversation.
    ///
    /// Any existing subscription for the same conversation is torn down
    /// first, including its pending reconnect. Returns as soon as the channel
    /// is requested; `SUBSCRIBED` on the status handler signals that messages
    /// will now be delivered.
    pub fn subscribe(
        &self,
        conversation_id: &str,
        handlers: ChannelHandlers,
    ) -> AppResult<SubscriptionHandle> {
        let conversation_id = ConversationId::parse(conversation_id)?;
        let inner = &self.inner;

        let mut registry = inner.lock();
        let mut replaced = None;
        if let Some(mut previous) = registry.remove(&conversation_id) {
            replaced = inner.teardown(&mut previous);
            debug!(
                conversation_id = %conversation_id,
                "Replaced existing conversation subscription"
            );
        }

        let mut registration = Registration::new(conversation_id.clone(), handlers);
        let channel_id = inner.open(&mut registration);
        registry.insert(registration);
        registry.connection_state = ConnectionState::Connecting;
        drop(registry);

        if let Some(gate) = replaced {
            gate.wait_idle();
        }

        info!(
            conversation_id = %conversation_id,
            channel_id = %channel_id,
            "Conversation subscribed"
        );

        Ok(SubscriptionHandle::new(conversation_id, channel_id))
    }

    /// Unsubscribes from a conversation and forgets its handlers.
    ///
    /// No handler of the conversation runs after this returns, except when
    /// called from inside one of its own handlers. Unknown or malformed ids
    /// are ignored.
    pub fn unsubscribe(&self, conversation_id: &str) {
        self.unsubscribe_with(conversation_id, true);
    }

    /// Cancels the pending reconnect and closes the channel of a conversation.
    ///
    /// With `clear_registration` the handlers are forgotten as well;
    /// without it they stay registered (with their retry count) so a later
    /// reconnect can reuse them.
    pub fn unsubscribe_with(&self, conversation_id: &str, clear_registration: bool) {
        let Ok(conversation_id) = ConversationId::parse(conversation_id) else {
            debug!("Ignoring unsubscribe for malformed conversation id");
            return;
        };
        let inner = &self.inner;

        let mut registry = inner.lock();
        let closed = if clear_registration {
            registry.remove(&conversation_id).map(|mut registration| {
                info!(conversation_id = %conversation_id, "Conversation unsubscribed");
                inner.teardown(&mut registration)
            })
        } else {
            registry.get_mut(&conversation_id).map(|registration| {
                debug!(conversation_id = %conversation_id, "Conversation channel released");
                inner.teardown(registration)
            })
        };
        drop(registry);

        if let Some(gate) = closed.flatten() {
            gate.wait_idle();
        }
    }

    /// Cancels every pending reconnect, closes every channel and clears the
    /// registry. Safe to call with nothing open.
    pub fn disconnect_all(&self) {
        let inner = &self.inner;

        let mut registry = inner.lock();
        let registrations = registry.drain();
        let count = registrations.len();
        let gates: Vec<Arc<DeliveryGate>> = registrations
            .into_iter()
            .filter_map(|mut registration| inner.teardown(&mut registration))
            .collect();
        registry.connection_state = ConnectionState::Disconnected;
        drop(registry);

        for gate in gates {
            gate.wait_idle();
        }

        if count > 0 {
            info!(count, "All conversation channels disconnected");
        }
    }

    /// Last status observed on any channel (last writer wins).
    ///
    /// Advisory only; use [`conversation_state`] for a specific conversation.
    ///
    /// [`conversation_state`]: ChannelConnectionManager::conversation_state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().connection_state
    }

    /// Connection state of one conversation, if it is registered.
    pub fn conversation_state(&self, conversation_id: &str) -> Option<ConnectionState> {
        self.inner.inspect(conversation_id, |reg| reg.state)
    }

    /// Number of open channels.
    pub fn active_channel_count(&self) -> usize {
        self.inner.lock().channel_count()
    }

    /// Number of registered conversations, with or without an open channel.
    pub fn registration_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Reconnects scheduled since the last `SUBSCRIBED`.
    pub fn retry_count(&self, conversation_id: &str) -> Option<u32> {
        self.inner.inspect(conversation_id, |reg| reg.retry_count)
    }

    /// When the conversation last reached `SUBSCRIBED`.
    pub fn last_connected_at(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .inspect(conversation_id, |reg| reg.last_connected_at)
            .flatten()
    }

    /// Delay of the pending reconnect, if one is scheduled.
    pub fn pending_retry_delay(&self, conversation_id: &str) -> Option<Duration> {
        self.inner
            .inspect(conversation_id, |reg| reg.retry.as_ref().map(|r| r.delay))
            .flatten()
    }

    /// Id of the conversation's open channel.
    pub fn current_channel(&self, conversation_id: &str) -> Option<ChannelId> {
        self.inner
            .inspect(conversation_id, |reg| reg.channel.as_ref().map(|ch| ch.id))
            .flatten()
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<RealtimeMetrics> {
        &self.inner.metrics
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn inspect<T>(&self, conversation_id: &str, f: impl FnOnce(&Registration) -> T) -> Option<T> {
        let conversation_id = ConversationId::parse(conversation_id).ok()?;
        self.lock().get(&conversation_id).map(f)
    }

    fn filter_for(&self, conversation_id: &ConversationId) -> PostgresChangesFilter {
        PostgresChangesFilter {
            event: ChangeEvent::Insert,
            schema: self.messages.schema.clone(),
            table: self.messages.table.clone(),
            column: self.messages.conversation_column.clone(),
            value: conversation_id.to_string(),
        }
    }

    /// Opens a new channel for `registration`. Caller holds the lock.
    fn open(self: &Arc<Self>, registration: &mut Registration) -> ChannelId {
        let channel_id = ChannelId(self.next_channel_id.fetch_add(1, Ordering::Relaxed));
        let conversation_id = registration.conversation_id.clone();

        let request = ChannelRequest {
            topic: format!("messages:{conversation_id}"),
            changes: self.filter_for(&conversation_id),
            presence: registration
                .handlers
                .wants_presence()
                .then(|| PresenceConfig { key: String::new() }),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(self),
            conversation_id,
            channel_id,
            rx,
        ));
        self.transport
            .open_channel(channel_id, request, ChannelEventSender::new(channel_id, tx));

        registration.channel = Some(LiveChannel {
            id: channel_id,
            pump,
            gate: Arc::new(DeliveryGate::new()),
        });
        registration.state = ConnectionState::Connecting;
        self.metrics.channel_opened();
        channel_id
    }

    /// Cancels the pending retry and closes the channel, keeping handlers.
    /// Caller holds the lock. Returns the closed channel's gate.
    fn teardown(&self, registration: &mut Registration) -> Option<Arc<DeliveryGate>> {
        if let Some(retry) = registration.retry.take() {
            retry.task.abort();
            trace!(
                conversation_id = %registration.conversation_id,
                "Pending reconnect cancelled"
            );
        }
        registration.state = ConnectionState::Disconnected;
        let channel = registration.channel.take()?;
        channel.pump.abort();
        channel.gate.close();
        self.transport.close_channel(channel.id);
        self.metrics.channel_closed();
        Some(channel.gate)
    }

    fn handle_event(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        channel_id: ChannelId,
        event: ChannelEvent,
    ) {
        match event {
            ChannelEvent::Status(status) => self.handle_status(conversation_id, channel_id, status),
            ChannelEvent::Insert(record) => self.deliver_message(conversation_id, channel_id, record),
            ChannelEvent::PresenceSync(state) => {
                self.deliver_presence(conversation_id, channel_id, state)
            }
        }
    }

    fn handle_status(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        channel_id: ChannelId,
        status: ChannelStatus,
    ) {
        let next_state = match &status {
            ChannelStatus::Subscribed => Some(ConnectionState::Connected),
            s if s.is_failure() => Some(ConnectionState::Disconnected),
            _ => None,
        };

        let (handler, gate) = {
            let mut registry = self.lock();
            let Some(registration) = registry.current_mut(conversation_id, channel_id) else {
                self.drop_late(conversation_id, channel_id, "status");
                return;
            };

            if status == ChannelStatus::Subscribed {
                registration.retry_count = 0;
                registration.last_connected_at = Some(Utc::now());
            }
            if let Some(state) = next_state {
                registration.state = state;
            }
            let handler = registration.handlers.on_status_change.clone();
            let gate = delivery_gate(registration);
            if let Some(state) = next_state {
                registry.connection_state = state;
            }
            (handler, gate)
        };
        let Some(gate) = gate else {
            return;
        };

        if status.is_failure() {
            warn!(
                conversation_id = %conversation_id,
                channel_id = %channel_id,
                status = %status,
                "Conversation channel failed"
            );
        } else {
            debug!(
                conversation_id = %conversation_id,
                channel_id = %channel_id,
                status = %status,
                "Conversation channel status"
            );
        }

        if gate.run(|| handler(&status)).is_none() {
            self.drop_late(conversation_id, channel_id, "status");
            return;
        }
        self.metrics.status_forwarded();

        if status.is_failure() {
            self.schedule_reconnect(conversation_id, channel_id);
        }
    }

    fn deliver_message(
        &self,
        conversation_id: &ConversationId,
        channel_id: ChannelId,
        record: ChangeRecord,
    ) {
        let current = self
            .lock()
            .current(conversation_id, channel_id)
            .and_then(|reg| Some((reg.handlers.on_message.clone(), delivery_gate(reg)?)));
        let Some((handler, gate)) = current else {
            self.drop_late(conversation_id, channel_id, "message");
            return;
        };

        if !self.filter_for(conversation_id).matches(&record) {
            debug!(
                conversation_id = %conversation_id,
                table = %record.table,
                "Dropping row outside conversation filter"
            );
            return;
        }

        if gate.run(|| handler(record)).is_none() {
            self.drop_late(conversation_id, channel_id, "message");
            return;
        }
        self.metrics.message_delivered();
    }

    fn deliver_presence(
        &self,
        conversation_id: &ConversationId,
        channel_id: ChannelId,
        state: PresenceState,
    ) {
        let current = self
            .lock()
            .current(conversation_id, channel_id)
            .and_then(|reg| Some((reg.handlers.on_presence.clone(), delivery_gate(reg)?)));
        let Some((handler, gate)) = current else {
            self.drop_late(conversation_id, channel_id, "presence");
            return;
        };
        let Some(handler) = handler else {
            return;
        };

        if gate.run(|| handler(state)).is_none() {
            self.drop_late(conversation_id, channel_id, "presence");
            return;
        }
        self.metrics.presence_synced();
    }

    fn drop_late(&self, conversation_id: &ConversationId, channel_id: ChannelId, kind: &str) {
        trace!(
            conversation_id = %conversation_id,
            channel_id = %channel_id,
            kind,
            "Dropping event from stale channel"
        );
        self.metrics.late_event_dropped();
    }

    /// Schedules a reconnect for the channel that just failed, replacing any
    /// pending one.
    fn schedule_reconnect(self: &Arc<Self>, conversation_id: &ConversationId, channel_id: ChannelId) {
        let mut registry = self.lock();
        let Some(registration) = registry.current_mut(conversation_id, channel_id) else {
            return;
        };

        let delay = self.backoff.delay_for(registration.retry_count);
        registration.retry_count = registration.retry_count.saturating_add(1);

        if let Some(previous) = registration.retry.take() {
            previous.task.abort();
        }

        let token = self.next_retry_token.fetch_add(1, Ordering::Relaxed);
        let manager = Arc::downgrade(self);
        let id = conversation_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = manager.upgrade() {
                inner.reconnect(&id, token);
            }
        });

        registration.retry = Some(PendingRetry { token, delay, task });
        let retry_count = registration.retry_count;
        drop(registry);

        self.metrics.reconnect_scheduled();
        info!(
            conversation_id = %conversation_id,
            delay_ms = delay.as_millis() as u64,
            retry_count,
            "Conversation reconnect scheduled"
        );
    }

    /// Timer body: reopen the channel with the stored handlers.
    fn reconnect(self: &Arc<Self>, conversation_id: &ConversationId, token: u64) {
        let mut registry = self.lock();
        let Some(registration) = registry.get_mut(conversation_id) else {
            debug!(conversation_id = %conversation_id, "Reconnect fired after unsubscribe");
            return;
        };
        if registration.retry.as_ref().map(|r| r.token) != Some(token) {
            debug!(conversation_id = %conversation_id, "Stale reconnect timer ignored");
            return;
        }

        // This task is the pending retry; release it without aborting itself.
        registration.retry = None;
        self.teardown(registration);
        let channel_id = self.open(registration);
        let retry_count = registration.retry_count;
        registry.connection_state = ConnectionState::Connecting;
        drop(registry);

        self.metrics.reconnect_attempted();
        info!(
            conversation_id = %conversation_id,
            channel_id = %channel_id,
            retry_count,
            "Conversation channel reopened"
        );
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let registrations = self
            .registry
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain();
        for mut registration in registrations {
            let _ = self.teardown(&mut registration);
        }
    }
}

fn delivery_gate(registration: &Registration) -> Option<Arc<DeliveryGate>> {
    registration.channel.as_ref().map(|ch| ch.gate.clone())
}

/// Forwards one channel's events to the manager in emission order.
async fn pump_events(
    manager: Weak<ManagerInner>,
    conversation_id: ConversationId,
    channel_id: ChannelId,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = manager.upgrade() else {
            break;
        };
        inner.handle_event(&conversation_id, channel_id, event);
    }
    trace!(channel_id = %channel_id, "Channel event pump stopped");
}
