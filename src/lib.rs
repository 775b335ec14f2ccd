//! # servisor
//!
//! **Servisor** is a control-plane supervisor for fleets of instrument
//! service processes. It launches services on demand, routes requests
//! between clients and services over a framed TCP protocol, watches
//! liveness through dual heartbeat channels, and tears the fleet down in
//! dependency order with escalating force.
//!
//! ## Architecture
//! ```text
//!  clients ──┐                                  ┌── service process
//!  clients ──┼──► TCP / FrameCodec ──► PeerTable┼── service process
//!  clients ──┘        (identities)        │     └── service process
//!                                         ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │  Router (single-threaded dispatch loop)                       │
//! │  - Fleet handlers (require_service, experiments, config)      │
//! │  - per-service pending queues, OPENED flush                   │
//! │  - REGISTER / HEARTBEAT / REPLY relay                         │
//! └──────┬──────────────────────┬─────────────────────┬───────────┘
//!        ▼                      ▼                     ▼
//!  ServiceRegistry        LivenessMonitor      ShutdownSequencer
//!  (references, graph)    (heartbeat sweeps)   (stop→int→kill)
//!        │                      │                     │
//!        └────────── publish(Event) ──► Bus ──► LogWriter
//! ```
//!
//! ### Lifecycle
//! ```text
//! Config ──► Supervisor::builder(cfg).build() ──► Supervisor::run()
//!   launch:  require_service ──► spawn child ──► REGISTER ──► OPENED
//!   live:    HEARTBEAT (push) + heartbeat stream (polled)
//!   stop:    signal ──► sequencer: stop ─leniency─► SIGINT ─► kill
//! ```
//!
//! ## Example
//! ```no_run
//! use servisor::{Config, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config::from_yaml("services: {}")?;
//!     let sup = Supervisor::builder(cfg).build()?;
//!     sup.run().await?;
//!     Ok(())
//! }
//! ```

mod builder;
mod config;
mod datastream;
mod distributor;
mod error;
mod events;
mod monitor;
mod process;
mod protocol;
mod proxy;
mod registry;
mod router;
mod sequencer;
mod shutdown;
mod supervisor;

// ---- Public re-exports ----

pub use builder::SupervisorBuilder;
pub use config::Config;
pub use datastream::{DataStream, StreamFrame};
pub use distributor::{Distributor, TelemetryClass};
pub use error::{ConfigError, ProtocolError, ProxyError, RouterError};
pub use events::{Bus, Event, EventKind, LogWriter};
pub use monitor::LivenessMonitor;
pub use process::{ChildProcess, ProcessControl, ServiceLauncher, SpawnLauncher};
pub use protocol::{
    Frame, FrameCodec, MessageKind, Reply, ReplyStatus, Request, ServiceStatus, Source,
    MAX_FRAME_SIZE,
};
pub use proxy::{Capability, CommandHandle, ServiceProxy};
pub use registry::{
    DependencyGraph, Identity, PendingRequest, ServiceDescriptor, ServiceReference,
    ServiceRegistry, ServiceState,
};
pub use router::{PeerTable, Router};
pub use sequencer::{ShutdownSequencer, StopRequester};
pub use supervisor::Supervisor;
