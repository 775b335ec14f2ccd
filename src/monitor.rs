//! Liveness monitor: advances service state from process existence and
//! heartbeat freshness.
//!
//! ```text
//! every poll tick:
//!   ├─► reap exited children
//!   ├─► live reference, launched process gone   → CRASHED
//!   ├─► RUNNING, heartbeat older than window    → UNRESPONSIVE
//!   └─► UNRESPONSIVE, fresh heartbeat observed  → RUNNING
//! ```
//!
//! ## Rules
//! - The monitor never kills anything; destructive actions belong to the
//!   shutdown sequencer alone, preserving a single writer.
//! - Heartbeat age uses the freshest of the two channels (pushed message,
//!   polled stream).
//! - A reference that never had a process handle (externally started,
//!   registered over the wire) is judged by heartbeats alone.
//! - Transitions are applied through the reference's state machine, so a
//!   concurrent transition that already happened simply makes the edge a
//!   no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::events::{Bus, Event, EventKind};
use crate::registry::{ServiceReference, ServiceRegistry, ServiceState};

/// Background poll loop watching every reference in the registry.
pub struct LivenessMonitor {
    registry: Arc<ServiceRegistry>,
    bus: Bus,
    /// Maximum tolerated heartbeat age.
    window: Duration,
    /// Poll cadence.
    tick: Duration,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        bus: Bus,
        window: Duration,
        tick: Duration,
    ) -> Self {
        Self {
            registry,
            bus,
            window,
            tick,
        }
    }

    /// Runs the poll loop until cancellation.
    pub fn spawn(self, token: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => self.sweep(),
                }
            }
        });
    }

    /// One monitoring pass over the registry.
    pub fn sweep(&self) {
        for reference in self.registry.iter() {
            self.inspect(reference);
        }
    }

    fn inspect(&self, reference: &Arc<ServiceReference>) {
        let state = reference.state();
        if !state.is_live() {
            return;
        }

        // Reap first so exits are observed exactly once per handle.
        // Externally registered services never had a handle attached; their
        // liveness is heartbeat-only, so only the staleness edges apply.
        let process_gone = reference
            .with_process(|p| {
                p.try_reap();
                !p.is_alive()
            })
            .unwrap_or(false);

        if process_gone {
            reference.clear_process();
            if reference.set_state(ServiceState::Crashed) {
                self.bus.publish(
                    Event::now(EventKind::ServiceCrashed)
                        .with_service(reference.id())
                        .with_state(ServiceState::Crashed)
                        .with_reason("process no longer exists"),
                );
            }
            return;
        }

        let stale = reference
            .freshest_heartbeat()
            .map(|at| at.elapsed() > self.window)
            // Never heartbeated: stale only matters once RUNNING.
            .unwrap_or(true);

        match state {
            ServiceState::Running if stale => {
                if reference.set_state(ServiceState::Unresponsive) {
                    self.bus.publish(
                        Event::now(EventKind::ServiceUnresponsive)
                            .with_service(reference.id())
                            .with_state(ServiceState::Unresponsive),
                    );
                }
            }
            ServiceState::Unresponsive if !stale => {
                if reference.set_state(ServiceState::Running) {
                    self.bus.publish(
                        Event::now(EventKind::ServiceRecovered)
                            .with_service(reference.id())
                            .with_state(ServiceState::Running),
                    );
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeProcess;
    use crate::registry::ServiceDescriptor;
    use std::sync::atomic::Ordering;

    fn setup(ids: &[&str]) -> (Arc<ServiceRegistry>, LivenessMonitor) {
        let descriptors = ids
            .iter()
            .map(|id| ServiceDescriptor::new(*id, "sim"))
            .collect();
        let registry = Arc::new(ServiceRegistry::build(descriptors, None).unwrap());
        let monitor = LivenessMonitor::new(
            registry.clone(),
            Bus::new(64),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        (registry, monitor)
    }

    #[tokio::test]
    async fn vanished_process_is_crashed_within_one_sweep() {
        let (registry, monitor) = setup(&["camera"]);
        let camera = registry.get("camera").unwrap();
        camera.set_state(ServiceState::Initializing);
        camera.set_state(ServiceState::Running);
        camera.mark_heartbeat();

        let (process, state) = FakeProcess::alive(41);
        camera.attach_process(Box::new(process));

        monitor.sweep();
        assert_eq!(camera.state(), ServiceState::Running, "still alive");

        state.alive.store(false, Ordering::SeqCst);
        monitor.sweep();
        assert_eq!(camera.state(), ServiceState::Crashed);
        assert!(!camera.has_process(), "handle dropped after confirmed exit");
        assert!(registry.live_set().is_empty());
    }

    #[tokio::test]
    async fn unresponsive_flap_is_idempotent() {
        let (registry, monitor) = setup(&["camera"]);
        let camera = registry.get("camera").unwrap();
        camera.set_state(ServiceState::Initializing);
        camera.set_state(ServiceState::Running);
        let (process, _state) = FakeProcess::alive(41);
        camera.attach_process(Box::new(process));

        camera.mark_heartbeat();
        tokio::time::sleep(Duration::from_millis(80)).await;
        monitor.sweep();
        assert_eq!(camera.state(), ServiceState::Unresponsive);
        monitor.sweep();
        assert_eq!(camera.state(), ServiceState::Unresponsive, "no flapping");

        camera.mark_heartbeat();
        monitor.sweep();
        assert_eq!(camera.state(), ServiceState::Running);
    }

    #[tokio::test]
    async fn externally_registered_service_lives_on_heartbeats_alone() {
        let (registry, monitor) = setup(&["camera"]);
        let camera = registry.get("camera").unwrap();
        // Registered over the wire: live states, no process handle ever.
        camera.set_state(ServiceState::Initializing);
        camera.set_state(ServiceState::Running);
        camera.mark_heartbeat();

        monitor.sweep();
        assert_eq!(camera.state(), ServiceState::Running, "fresh heartbeat keeps it live");

        tokio::time::sleep(Duration::from_millis(80)).await;
        monitor.sweep();
        assert_eq!(
            camera.state(),
            ServiceState::Unresponsive,
            "staleness still applies without a handle"
        );

        camera.mark_heartbeat();
        monitor.sweep();
        assert_eq!(camera.state(), ServiceState::Running);
    }

    #[tokio::test]
    async fn monitor_never_touches_closed_references() {
        let (registry, monitor) = setup(&["camera"]);
        let camera = registry.get("camera").unwrap();
        monitor.sweep();
        assert_eq!(camera.state(), ServiceState::Closed);
    }

    #[tokio::test]
    async fn crashed_while_unresponsive_is_detected() {
        let (registry, monitor) = setup(&["camera"]);
        let camera = registry.get("camera").unwrap();
        camera.set_state(ServiceState::Initializing);
        camera.set_state(ServiceState::Running);
        camera.set_state(ServiceState::Unresponsive);

        let (process, state) = FakeProcess::alive(41);
        camera.attach_process(Box::new(process));
        state.alive.store(false, Ordering::SeqCst);

        monitor.sweep();
        assert_eq!(camera.state(), ServiceState::Crashed);
    }
}
