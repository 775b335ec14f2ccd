//! Runtime events emitted by the supervisor components.
//!
//! [`EventKind`] classifies events across three categories:
//! - **Lifecycle**: service launch/registration/readiness and liveness flaps
//! - **Shutdown**: teardown progress and escalation steps
//! - **Router**: per-message handling failures that were caught and logged
//!
//! Each event carries a globally unique, monotonically increasing sequence
//! number; use `seq` to restore order when events are observed out of order.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::registry::ServiceState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Service lifecycle ===
    /// Child process spawned; sets `service`.
    ServiceLaunched,
    /// Registration handshake completed; sets `service`.
    ServiceRegistered,
    /// OPENED received, pending queue flushed; sets `service`.
    ServiceOpened,
    /// Heartbeat went stale while the process is alive; sets `service`.
    ServiceUnresponsive,
    /// Fresh heartbeat after a stale window; sets `service`.
    ServiceRecovered,
    /// Process no longer exists; sets `service`.
    ServiceCrashed,
    /// Graceful stop confirmed; sets `service`.
    ServiceClosed,
    /// Service voluntarily reported a safety fallback; sets `service`, `reason`.
    ServiceFailSafe,

    // === Shutdown ===
    /// Teardown begins (signal or request).
    ShutdownRequested,
    /// One escalation step taken; sets `service`, `reason` (step name).
    EscalationAdvanced,
    /// Final forced kill; always reported. Sets `service`.
    ServiceForceKilled,
    /// Live set drained; teardown done.
    ShutdownComplete,

    // === Router ===
    /// Per-message handling error, caught and logged; sets `reason`.
    RouterError,
}

/// Runtime event with optional metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Service id, if applicable.
    pub service: Option<Arc<str>>,
    /// Human-readable reason (errors, escalation step, fallback cause).
    pub reason: Option<Arc<str>>,
    /// New lifecycle state, for transition events.
    pub state: Option<ServiceState>,
}

impl Event {
    /// Creates an event of the given kind with the next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            service: None,
            reason: None,
            state: None,
        }
    }

    /// Attaches a service id.
    #[inline]
    pub fn with_service(mut self, service: impl Into<Arc<str>>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches the new lifecycle state.
    #[inline]
    pub fn with_state(mut self, state: ServiceState) -> Self {
        self.state = Some(state);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::now(EventKind::ServiceLaunched);
        let b = Event::now(EventKind::ServiceRegistered);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn builders_attach_metadata() {
        let ev = Event::now(EventKind::ServiceCrashed)
            .with_service("camera")
            .with_reason("process gone")
            .with_state(ServiceState::Crashed);
        assert_eq!(ev.service.as_deref(), Some("camera"));
        assert_eq!(ev.reason.as_deref(), Some("process gone"));
        assert_eq!(ev.state, Some(ServiceState::Crashed));
    }
}
