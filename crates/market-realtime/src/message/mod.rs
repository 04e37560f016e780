//! Events delivered by a transport for one channel.

pub mod presence;
pub mod types;

pub use presence::PresenceState;
pub use types::{ChangeRecord, ChannelEvent};
