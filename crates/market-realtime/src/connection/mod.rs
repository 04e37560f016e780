//! Conversation channel supervision.

pub mod backoff;
pub mod manager;

pub use backoff::Backoff;
pub use manager::ChannelConnectionManager;
