//! Per-service runtime record and its lifecycle state machine.
//!
//! One [`ServiceReference`] exists per descriptor for the registry's
//! lifetime; a restart reuses it. The reference owns every mutable runtime
//! field for its service: lifecycle state (mirrored into a state stream for
//! external polling), process handle, registered address, heartbeat
//! freshness from both channels, and the pending-request FIFO.
//!
//! ## State machine
//! ```text
//! CLOSED ── launch ──► INITIALIZING ── register+heartbeat ──► RUNNING
//!    ▲                      │                                  │   ▲
//!    │                      │ process gone                     ▼   │ fresh heartbeat
//!    │                      ▼                          UNRESPONSIVE │
//!    │                   CRASHED ◄── process gone ──────────┘──────┘
//!    │                      │
//!    └── stop confirmed ────┴── (CLOSED/CRASHED/FAIL_SAFE ── restart ──► INITIALIZING)
//! ```
//!
//! ## Rules
//! - `set_state` applies only the edges above; anything else is rejected.
//! - The process handle is non-null iff a process was launched and not yet
//!   confirmed exited.
//! - The pending FIFO is drained exactly once, on OPENED, in arrival order;
//!   it is never persisted.
//! - Heartbeat freshness is the max of the pushed-message timestamp and the
//!   polled heartbeat-stream timestamp.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;

use crate::datastream::DataStream;
use crate::process::ProcessControl;
use crate::registry::ServiceDescriptor;

/// Opaque peer identity assigned at the transport edge.
pub type Identity = Bytes;

/// Lifecycle state of one supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// No process; the resting state.
    Closed,
    /// Launch requested; waiting for registration and first heartbeat.
    Initializing,
    /// Registered, heartbeating, serving.
    Running,
    /// Process alive but heartbeat older than the liveness window.
    Unresponsive,
    /// Process no longer exists while it was expected to.
    Crashed,
    /// Service voluntarily reported a safety fallback.
    FailSafe,
}

impl ServiceState {
    /// Live states: a process is (believed) present and owns its port.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ServiceState::Initializing | ServiceState::Running | ServiceState::Unresponsive
        )
    }

    /// States a restart may leave from.
    pub fn is_restartable(self) -> bool {
        matches!(
            self,
            ServiceState::Closed | ServiceState::Crashed | ServiceState::FailSafe
        )
    }

    /// Integer code mirrored into the state stream for external polling.
    pub fn as_code(self) -> i64 {
        match self {
            ServiceState::Closed => 0,
            ServiceState::Initializing => 1,
            ServiceState::Running => 2,
            ServiceState::Unresponsive => 3,
            ServiceState::Crashed => 4,
            ServiceState::FailSafe => 5,
        }
    }

    /// Checks one edge of the transition table.
    fn may_move_to(self, to: ServiceState) -> bool {
        use ServiceState::*;
        match (self, to) {
            // launch / restart
            (Closed | Crashed | FailSafe, Initializing) => true,
            // registration handshake + first heartbeat
            (Initializing, Running) => true,
            // liveness flapping
            (Running, Unresponsive) => true,
            (Unresponsive, Running) => true,
            // process vanished
            (Initializing | Running | Unresponsive, Crashed) => true,
            // voluntary safety fallback
            (Initializing | Running | Unresponsive, FailSafe) => true,
            // graceful stop confirmed, from any non-CLOSED state
            (from, Closed) => from != Closed,
            _ => false,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Closed => "closed",
            ServiceState::Initializing => "initializing",
            ServiceState::Running => "running",
            ServiceState::Unresponsive => "unresponsive",
            ServiceState::Crashed => "crashed",
            ServiceState::FailSafe => "fail_safe",
        };
        f.write_str(s)
    }
}

/// One queued request awaiting OPENED.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Client identity the reply must be relayed to.
    pub client: Identity,
    /// Raw request payload, forwarded verbatim.
    pub payload: Bytes,
}

/// Runtime record for one service. Shared across the router, the liveness
/// monitor, and the shutdown sequencer; plain fields are mutex-guarded, the
/// state is additionally mirrored into a single-writer stream slot.
pub struct ServiceReference {
    descriptor: ServiceDescriptor,
    /// Ids this service depends on (computed once).
    pub dependencies: Vec<String>,
    /// Ids that depend on this service (computed once).
    pub depended_on_by: Vec<String>,

    state: Mutex<ServiceState>,
    /// State codes for external pollers; written only under the state lock.
    state_stream: DataStream,

    process: Mutex<Option<Box<dyn ProcessControl>>>,
    address: Mutex<Option<(String, u16)>>,
    assigned_port: Mutex<Option<u16>>,

    last_push_heartbeat: Mutex<Option<Instant>>,
    heartbeat_stream: Mutex<Option<DataStream>>,

    open: AtomicBool,
    pending: Mutex<VecDeque<PendingRequest>>,
}

impl ServiceReference {
    /// Materializes the reference for one descriptor with its computed
    /// dependency edges.
    pub fn new(
        descriptor: ServiceDescriptor,
        dependencies: Vec<String>,
        depended_on_by: Vec<String>,
    ) -> Self {
        let state_stream = DataStream::create(format!("{}.state", descriptor.id), 16);
        Self {
            descriptor,
            dependencies,
            depended_on_by,
            state: Mutex::new(ServiceState::Closed),
            state_stream,
            process: Mutex::new(None),
            address: Mutex::new(None),
            assigned_port: Mutex::new(None),
            last_push_heartbeat: Mutex::new(None),
            heartbeat_stream: Mutex::new(None),
            open: AtomicBool::new(false),

            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn service_type(&self) -> &str {
        &self.descriptor.service_type
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    // ---- state ----

    pub fn state(&self) -> ServiceState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Applies one transition if the table allows it; mirrors the new state
    /// into the state stream. Returns whether the edge was taken.
    pub fn set_state(&self, to: ServiceState) -> bool {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == to || !state.may_move_to(to) {
            return false;
        }
        *state = to;
        self.state_stream.submit_value(to.as_code());
        if !to.is_live() {
            self.open.store(false, Ordering::SeqCst);
        }
        true
    }

    /// Externally pollable state-code stream.
    pub fn state_stream(&self) -> DataStream {
        self.state_stream.open()
    }

    // ---- process ----

    pub fn attach_process(&self, process: Box<dyn ProcessControl>) {
        *self.process.lock().expect("process lock poisoned") = Some(process);
    }

    /// Runs `f` against the process handle, if one is attached.
    pub fn with_process<R>(&self, f: impl FnOnce(&mut dyn ProcessControl) -> R) -> Option<R> {
        let mut guard = self.process.lock().expect("process lock poisoned");
        guard.as_mut().map(|p| f(p.as_mut()))
    }

    /// Drops the handle once the process is confirmed gone.
    pub fn clear_process(&self) {
        *self.process.lock().expect("process lock poisoned") = None;
    }

    pub fn has_process(&self) -> bool {
        self.process.lock().expect("process lock poisoned").is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.with_process(|p| p.pid())
    }

    // ---- address / port ----

    pub fn set_address(&self, host: String, port: u16) {
        *self.address.lock().expect("address lock poisoned") = Some((host, port));
    }

    pub fn address(&self) -> Option<(String, u16)> {
        self.address.lock().expect("address lock poisoned").clone()
    }

    pub fn set_assigned_port(&self, port: u16) {
        *self.assigned_port.lock().expect("port lock poisoned") = Some(port);
    }

    pub fn assigned_port(&self) -> Option<u16> {
        *self.assigned_port.lock().expect("port lock poisoned")
    }

    // ---- heartbeats ----

    /// Records a pushed HEARTBEAT message.
    pub fn mark_heartbeat(&self) {
        *self
            .last_push_heartbeat
            .lock()
            .expect("heartbeat lock poisoned") = Some(Instant::now());
    }

    /// Attaches the service's heartbeat stream at registration.
    pub fn attach_heartbeat_stream(&self, stream: DataStream) {
        *self
            .heartbeat_stream
            .lock()
            .expect("heartbeat lock poisoned") = Some(stream);
    }

    /// Freshest heartbeat across both channels: the pushed message and the
    /// polled stream. `None` if neither has ever fired.
    pub fn freshest_heartbeat(&self) -> Option<Instant> {
        let push = *self
            .last_push_heartbeat
            .lock()
            .expect("heartbeat lock poisoned");
        let stream = self
            .heartbeat_stream
            .lock()
            .expect("heartbeat lock poisoned")
            .as_ref()
            .and_then(|s| s.latest())
            .map(|f| f.at);
        match (push, stream) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    // ---- readiness / pending queue ----

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Marks the service opened. Returns the queued requests, FIFO.
    pub fn mark_opened(&self) -> Vec<PendingRequest> {
        self.open.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.drain(..).collect()
    }

    /// Queues a request until OPENED arrives.
    pub fn enqueue(&self, client: Identity, payload: Bytes) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .push_back(PendingRequest { client, payload });
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// A process registered back and has not closed/crashed since.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ServiceState::Running | ServiceState::Unresponsive
        )
    }
}
