//! Event-to-log bridge.
//!
//! [`LogWriter`] subscribes to the [`Bus`] on a background task and renders
//! every event through `tracing`, so the supervisor's own telemetry shows up
//! in whatever subscriber the host process installed.

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Bus, Event, EventKind};

/// Background worker logging every bus event.
pub struct LogWriter;

impl LogWriter {
    /// Subscribes to the bus and logs until cancellation.
    pub fn spawn(bus: &Bus, token: CancellationToken) {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => Self::write(&ev),
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(n)) => {
                            warn!(skipped = n, "event log fell behind the bus");
                        }
                    }
                }
            }
        });
    }

    fn write(ev: &Event) {
        let service = ev.service.as_deref().unwrap_or("-");
        let reason = ev.reason.as_deref().unwrap_or("");
        match ev.kind {
            EventKind::ServiceCrashed | EventKind::RouterError => {
                error!(seq = ev.seq, service, reason, kind = ?ev.kind, "supervisor event");
            }
            EventKind::ServiceUnresponsive
            | EventKind::ServiceFailSafe
            | EventKind::ServiceForceKilled => {
                warn!(seq = ev.seq, service, reason, kind = ?ev.kind, "supervisor event");
            }
            _ => {
                info!(seq = ev.seq, service, reason, kind = ?ev.kind, "supervisor event");
            }
        }
    }
}
