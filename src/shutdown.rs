//! Cross-platform OS signal handling.
//!
//! Two helpers drive teardown:
//! - [`wait_for_shutdown_signal`] completes on the first termination
//!   signal and starts the graceful shutdown sequence.
//! - [`spawn_override_listener`] then watches for further interrupts;
//!   each one engages the operator override, zeroing the sequencer's
//!   remaining leniency timeouts.
//!
//! ## Unix
//! SIGINT, SIGTERM, and SIGQUIT are handled, with
//! [`tokio::signal::ctrl_c`] awaited as a fallback.
//!
//! ## Windows
//! Only [`tokio::signal::ctrl_c`] is awaited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Watches for interrupts arriving after teardown has begun. The first one
/// sets the operator override flag; the listener keeps draining further
/// signals so they cannot kill the process before the sequencer finishes.
pub fn spawn_override_listener(
    override_flag: Arc<AtomicBool>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                result = wait_for_shutdown_signal() => {
                    if result.is_err() {
                        return;
                    }
                    if !override_flag.swap(true, Ordering::SeqCst) {
                        warn!("operator override engaged: remaining shutdown leniency zeroed");
                    }
                }
            }
        }
    })
}
