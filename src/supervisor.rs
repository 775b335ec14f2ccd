//! Supervisor: wires the transport, router, monitor, and sequencer.
//!
//! [`Supervisor::run`] owns the runtime lifecycle:
//!
//! ```text
//! run():
//!   - bind the router listener, spawn the peer accept loop
//!   - spawn Router::run (single-threaded dispatch loop)
//!   - spawn LivenessMonitor (heartbeat sweeps)
//!   - spawn LogWriter (event bus → process log)
//!   - spawn the telemetry distributors (logs, traces)
//!
//! Shutdown path:
//!   wait_for_shutdown_signal()
//!     └─► Bus.publish(ShutdownRequested)
//!     └─► spawn_override_listener (further interrupts zero leniency)
//!     └─► ShutdownSequencer::run() to an empty live set
//!     └─► cancel everything, join the router
//! ```
//!
//! ## Rules
//! - The router keeps serving during teardown: stop requests go out over
//!   service connections and replies still flow until the live set drains.
//! - Destructive process actions happen only inside the sequencer.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::builder::SupervisorBuilder;
use crate::config::Config;
use crate::distributor::{Distributor, TelemetryClass};
use crate::error::RouterError;
use crate::events::{Bus, Event, EventKind, LogWriter};
use crate::monitor::LivenessMonitor;
use crate::registry::ServiceRegistry;
use crate::router::{peers, PeerTable, Router};
use crate::sequencer::ShutdownSequencer;
use crate::shutdown;

const INBOUND_CAPACITY: usize = 1024;

/// Control-plane runtime: registry, router, monitor, and sequencer under
/// one lifecycle.
pub struct Supervisor {
    cfg: Config,
    registry: Arc<ServiceRegistry>,
    bus: Bus,
}

impl Supervisor {
    /// Starts builder-style construction.
    pub fn builder(cfg: Config) -> SupervisorBuilder {
        SupervisorBuilder::new(cfg)
    }

    pub(crate) fn new_internal(cfg: Config, registry: Arc<ServiceRegistry>, bus: Bus) -> Self {
        Self { cfg, registry, bus }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Runs until an OS termination signal arrives and the shutdown
    /// sequence drains the live set, or until the router fails.
    pub async fn run(&self) -> Result<(), RouterError> {
        let token = CancellationToken::new();
        LogWriter::spawn(&self.bus, token.clone());

        let endpoint = format!("{}:{}", self.cfg.host, self.cfg.port);
        let listener = TcpListener::bind(&endpoint)
            .await
            .map_err(|source| RouterError::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;
        info!(%endpoint, "router listening");

        let peers = Arc::new(PeerTable::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(peers::serve(
            listener,
            peers.clone(),
            inbound_tx,
            token.clone(),
        ));

        self.spawn_distributors(&token).await;

        let router = Router::new(
            self.cfg.clone(),
            self.registry.clone(),
            self.bus.clone(),
            peers.clone(),
            inbound_rx,
        );
        let mut router_task = tokio::spawn(router.run(token.child_token()));

        LivenessMonitor::new(
            self.registry.clone(),
            self.bus.clone(),
            self.cfg.liveness_window,
            self.cfg.poll_tick,
        )
        .spawn(token.child_token());

        let sequencer = ShutdownSequencer::new(
            self.registry.clone(),
            self.bus.clone(),
            peers.clone(),
            self.cfg.leniency,
            self.cfg.poll_tick,
        );

        tokio::select! {
            signal = shutdown::wait_for_shutdown_signal() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "signal handler failed, shutting down");
                }
                info!("termination signal received, shutting the fleet down");
                self.bus.publish(Event::now(EventKind::ShutdownRequested));
                shutdown::spawn_override_listener(sequencer.override_handle(), token.child_token());

                // Router and monitor stay up while the live set drains.
                sequencer.run().await;
                token.cancel();
                match router_task.await {
                    Ok(result) => result,
                    Err(_) => Ok(()),
                }
            }
            joined = &mut router_task => {
                token.cancel();
                joined.unwrap_or(Err(RouterError::TransportClosed))
            }
        }
    }

    /// One distributor per telemetry class, on ports derived from the
    /// router port: logs on +1/+2, traces on +3/+4.
    async fn spawn_distributors(&self, token: &CancellationToken) {
        for (class, offset) in [(TelemetryClass::Logs, 1u16), (TelemetryClass::Traces, 3)] {
            let collector = format!("{}:{}", self.cfg.host, self.cfg.port.saturating_add(offset));
            let publisher = format!(
                "{}:{}",
                self.cfg.host,
                self.cfg.port.saturating_add(offset + 1)
            );
            match Distributor::bind(class, &collector, &publisher).await {
                Ok(dist) => {
                    dist.spawn(token.clone());
                }
                Err(e) => {
                    // Telemetry relays are best-effort; the control plane
                    // runs without them.
                    tracing::warn!(error = %e, "distributor failed to bind");
                }
            }
        }
    }
}
