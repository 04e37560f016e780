//! Channel identity, handlers, and the per-conversation registry.

pub(crate) mod gate;
pub mod handlers;
pub(crate) mod registry;
pub mod types;

pub use handlers::ChannelHandlers;
pub use types::{ChannelId, ChannelStatus, ConnectionState, SubscriptionHandle};
