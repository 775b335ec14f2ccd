//! Broadcast bus for runtime events.
//!
//! Thin wrapper around [`tokio::sync::broadcast`] giving the router,
//! monitor, and sequencer a shared non-blocking `publish`/`subscribe` API.
//!
//! ## Rules
//! - `publish()` never blocks and never fails; with no subscribers the
//!   event is dropped.
//! - Bounded capacity: slow subscribers observe `RecvError::Lagged` and
//!   skip the overwritten items.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus with the given capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all active subscribers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates an independent receiver observing subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
