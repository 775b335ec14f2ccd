//! Shutdown sequencer: dependency-ordered, escalating teardown.
//!
//! Drives the live set to empty. Each service escalates through
//!
//! ```text
//! alive ── stop request ──► stopped ── leniency ──► interrupted ── leniency ──► terminated
//! ```
//!
//! and leaves the live set as soon as its process is confirmed exited,
//! whatever the current step. A service is escalated only once every entry
//! in its `depended_on_by` has left the live set. The operator override
//! (repeated interrupts) attenuates all remaining leniency timeouts to zero.
//!
//! ## Rules
//! - The sequencer is the single writer for destructive actions; the
//!   monitor only observes.
//! - The final forced kill is always reported.
//! - The driving loop blocks at most one poll interval per iteration.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::events::{Bus, Event, EventKind};
use crate::registry::{ServiceRegistry, ServiceState};

/// Sends the protocol-level cooperative stop request to one service.
///
/// The router's peer table implements this by writing a `stop` request on
/// the service's connection; tests substitute a recorder.
pub trait StopRequester: Send + Sync {
    fn request_stop(&self, service: &str);
}

/// Escalation step of one in-flight shutdown ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Alive,
    Stopped,
    Interrupted,
    Terminated,
}

/// Ephemeral per-service escalation state; discarded once the process is
/// confirmed gone.
struct Ticket {
    step: Step,
    since: Instant,
}

/// Escalating stop→interrupt→terminate state machine over the registry.
pub struct ShutdownSequencer {
    registry: Arc<ServiceRegistry>,
    bus: Bus,
    stopper: Arc<dyn StopRequester>,
    /// Per-step leniency before escalating.
    leniency: Duration,
    /// Poll interval of the driving loop.
    poll: Duration,
    /// Operator override: zeroes all remaining leniency timeouts.
    operator_override: Arc<AtomicBool>,
}

impl ShutdownSequencer {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        bus: Bus,
        stopper: Arc<dyn StopRequester>,
        leniency: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            registry,
            bus,
            stopper,
            leniency,
            poll,
            operator_override: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag the signal handler sets on repeated operator interrupts.
    pub fn override_handle(&self) -> Arc<AtomicBool> {
        self.operator_override.clone()
    }

    fn effective_leniency(&self) -> Duration {
        if self.operator_override.load(Ordering::SeqCst) {
            Duration::ZERO
        } else {
            self.leniency
        }
    }

    /// Iterates the live set to empty, then reports completion.
    pub async fn run(&self) {
        let mut live = self.registry.live_set();
        let mut tickets: HashMap<String, Ticket> = HashMap::new();

        while !live.is_empty() {
            self.pass(&mut live, &mut tickets);
            if live.is_empty() {
                break;
            }
            tokio::time::sleep(self.poll).await;
        }

        self.bus.publish(Event::now(EventKind::ShutdownComplete));
    }

    /// One pass: reap exits out of the live set, then escalate whoever the
    /// graph allows.
    fn pass(&self, live: &mut HashSet<String>, tickets: &mut HashMap<String, Ticket>) {
        let ids: Vec<String> = {
            let mut v: Vec<String> = live.iter().cloned().collect();
            v.sort_unstable();
            v
        };

        for id in ids {
            let Some(reference) = self.registry.get(&id) else {
                live.remove(&id);
                continue;
            };

            let gone = reference
                .with_process(|p| {
                    p.try_reap();
                    !p.is_alive()
                })
                .unwrap_or(true);
            if gone {
                reference.clear_process();
                reference.set_state(ServiceState::Closed);
                live.remove(&id);
                tickets.remove(&id);
                self.bus
                    .publish(Event::now(EventKind::ServiceClosed).with_service(id.as_str()));
                continue;
            }

            if !self.registry.graph().may_stop(&id, live) {
                continue;
            }

            let ticket = tickets.entry(id.clone()).or_insert(Ticket {
                step: Step::Alive,
                since: Instant::now(),
            });
            match ticket.step {
                Step::Alive => {
                    self.stopper.request_stop(&id);
                    ticket.step = Step::Stopped;
                    ticket.since = Instant::now();
                    self.bus.publish(
                        Event::now(EventKind::EscalationAdvanced)
                            .with_service(id.as_str())
                            .with_reason("stop requested"),
                    );
                }
                Step::Stopped => {
                    if ticket.since.elapsed() >= self.effective_leniency() {
                        reference.with_process(|p| p.interrupt());
                        ticket.step = Step::Interrupted;
                        ticket.since = Instant::now();
                        self.bus.publish(
                            Event::now(EventKind::EscalationAdvanced)
                                .with_service(id.as_str())
                                .with_reason("interrupt sent"),
                        );
                    }
                }
                Step::Interrupted => {
                    if ticket.since.elapsed() >= self.effective_leniency() {
                        reference.with_process(|p| p.terminate());
                        ticket.step = Step::Terminated;
                        ticket.since = Instant::now();
                        self.bus.publish(
                            Event::now(EventKind::ServiceForceKilled).with_service(id.as_str()),
                        );
                    }
                }
                // Kill issued; the next pass reaps the exit.
                Step::Terminated => {}
            }
        }
    }
}
