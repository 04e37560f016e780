//! Socket keepalive bookkeeping.

use super::frame::Frame;

/// What to do on a heartbeat tick.
#[derive(Debug, PartialEq)]
pub(crate) enum HeartbeatAction {
    /// Push this heartbeat.
    Send(Frame),
    /// The previous heartbeat was never acknowledged.
    TimedOut,
}

/// Tracks the outstanding heartbeat of one socket connection.
///
/// A heartbeat still unacknowledged when the next one is due means the
/// connection is dead.
#[derive(Debug, Default)]
pub(crate) struct HeartbeatMonitor {
    pending: Option<String>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self, reference: String) -> HeartbeatAction {
        if self.pending.is_some() {
            return HeartbeatAction::TimedOut;
        }
        self.pending = Some(reference.clone());
        HeartbeatAction::Send(Frame::heartbeat(reference))
    }

    /// Record a reply. Returns `true` if it acknowledged the pending heartbeat.
    pub fn acknowledge(&mut self, reference: &str) -> bool {
        if self.pending.as_deref() == Some(reference) {
            self.pending = None;
            true
        } else {
            false
        }
    }
}
