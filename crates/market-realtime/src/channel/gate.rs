//! Per-channel delivery gate.
//!
//! Every handler call for a channel runs inside its gate. Closing the gate
//! stops new calls from starting, and [`DeliveryGate::wait_idle`] blocks
//! until a call already in progress on another thread has returned.

use std::cell::Cell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

/// Resets the in-handler flag even if the handler panics.
struct HandlerScope {
    previous: bool,
}

impl HandlerScope {
    fn enter() -> Self {
        Self {
            previous: IN_HANDLER.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        IN_HANDLER.with(|flag| flag.set(self.previous));
    }
}

#[derive(Debug, Default)]
pub(crate) struct DeliveryGate {
    closed: AtomicBool,
    running: Mutex<()>,
}

impl DeliveryGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless the gate is closed. Returns `None` when closed.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let _running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let _scope = HandlerScope::enter();
        Some(f())
    }

    /// Stop any further handler calls.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Block until no handler call is in progress.
    ///
    /// Returns immediately on a thread that is itself inside a handler, so a
    /// handler may unsubscribe its own conversation.
    pub fn wait_idle(&self) {
        if IN_HANDLER.with(Cell::get) {
            return;
        }
        drop(self.running.lock().unwrap_or_else(|e| e.into_inner()));
    }
}
