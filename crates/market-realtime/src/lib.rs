//! # market-realtime
//!
//! Real-time conversation feed for the marketplace. Provides:
//!
//! - One supervised change-feed channel per buyer/seller conversation
//! - Automatic reconnect with capped exponential backoff
//! - A transport abstraction with an in-memory implementation and a
//!   Phoenix-channels WebSocket client for the hosted change feed
//! - Presence sync and connection-state reporting
//! - Lightweight counters for diagnostics

pub mod channel;
pub mod connection;
pub mod message;
pub mod metrics;
pub mod server;
pub mod transport;

pub use channel::handlers::{ChannelHandlers, ConversationEvent};
pub use channel::types::{ChannelId, ChannelStatus, ConnectionState, SubscriptionHandle};
pub use connection::manager::ChannelConnectionManager;
pub use message::types::{ChangeRecord, ChannelEvent};
pub use message::presence::PresenceState;
pub use metrics::RealtimeMetrics;
pub use server::RealtimeEngine;
pub use transport::RealtimeTransport;
