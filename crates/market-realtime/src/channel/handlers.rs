//! Caller-supplied callbacks for one conversation subscription.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use market_core::error::AppError;

use crate::channel::types::ChannelStatus;
use crate::message::presence::PresenceState;
use crate::message::types::ChangeRecord;

/// Invoked for every inserted message row.
pub type MessageHandler = Arc<dyn Fn(ChangeRecord) + Send + Sync>;
/// Invoked after every presence sync.
pub type PresenceHandler = Arc<dyn Fn(PresenceState) + Send + Sync>;
/// Invoked for every status the transport reports.
pub type StatusHandler = Arc<dyn Fn(&ChannelStatus) + Send + Sync>;

/// Handler set stored with a registration and reused across reconnects.
///
/// Handlers run on a Tokio task and must not block. They may call back into
/// the manager (for example to unsubscribe).
#[derive(Clone)]
pub struct ChannelHandlers {
    pub(crate) on_message: MessageHandler,
    pub(crate) on_presence: Option<PresenceHandler>,
    pub(crate) on_status_change: StatusHandler,
}

impl ChannelHandlers {
    /// Start building a handler set.
    pub fn builder() -> ChannelHandlersBuilder {
        ChannelHandlersBuilder::default()
    }

    /// Handlers that forward every callback into an unbounded channel.
    ///
    /// Events arrive on the receiver in the order the transport emitted them.
    /// When `with_presence` is false no presence sync is requested.
    pub fn channel(with_presence: bool) -> (Self, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let message_tx = tx.clone();
        let status_tx = tx.clone();
        let presence: Option<PresenceHandler> = with_presence.then(|| {
            let presence_tx = tx.clone();
            Arc::new(move |state: PresenceState| {
                let _ = presence_tx.send(ConversationEvent::Presence(state));
            }) as PresenceHandler
        });

        let handlers = Self {
            on_message: Arc::new(move |record: ChangeRecord| {
                let _ = message_tx.send(ConversationEvent::Message(record));
            }),
            on_presence: presence,
            on_status_change: Arc::new(move |status: &ChannelStatus| {
                let _ = status_tx.send(ConversationEvent::Status(status.clone()));
            }),
        };
        (handlers, rx)
    }

    /// Whether a presence handler is attached.
    pub fn wants_presence(&self) -> bool {
        self.on_presence.is_some()
    }
}

impl fmt::Debug for ChannelHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandlers")
            .field("on_presence", &self.on_presence.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ChannelHandlers`].
#[derive(Default)]
pub struct ChannelHandlersBuilder {
    on_message: Option<MessageHandler>,
    on_presence: Option<PresenceHandler>,
    on_status_change: Option<StatusHandler>,
}

impl ChannelHandlersBuilder {
    /// Required: called for each new message.
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(ChangeRecord) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Optional: called after each presence sync.
    pub fn on_presence<F>(mut self, f: F) -> Self
    where
        F: Fn(PresenceState) + Send + Sync + 'static,
    {
        self.on_presence = Some(Arc::new(f));
        self
    }

    /// Required: called for each status transition.
    pub fn on_status_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChannelStatus) + Send + Sync + 'static,
    {
        self.on_status_change = Some(Arc::new(f));
        self
    }

    /// Finish the handler set.
    ///
    /// Fails with a validation error if a required handler is missing.
    pub fn build(self) -> Result<ChannelHandlers, AppError> {
        let on_message = self
            .on_message
            .ok_or_else(|| AppError::validation("on_message handler is required"))?;
        let on_status_change = self
            .on_status_change
            .ok_or_else(|| AppError::validation("on_status_change handler is required"))?;

        Ok(ChannelHandlers {
            on_message,
            on_presence: self.on_presence,
            on_status_change,
        })
    }
}

/// A callback delivered through [`ChannelHandlers::channel`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// New message row.
    Message(ChangeRecord),
    /// Presence after sync.
    Presence(PresenceState),
    /// Status transition.
    Status(ChannelStatus),
}
