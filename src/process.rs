//! Child-process seam: launching, liveness probing, and termination.
//!
//! [`ProcessControl`] is the narrow trait the monitor and the shutdown
//! sequencer touch; the real implementation wraps a [`tokio::process::Child`].
//! Tests substitute a scripted fake, which keeps the state machine and the
//! escalation logic testable without spawning anything.
//!
//! ## Rules
//! - The monitor only *observes* (reap/probe); destructive actions
//!   (`interrupt`, `terminate`) are issued by the shutdown sequencer alone.
//! - `try_reap` is the only way a process handle learns its child exited;
//!   after it reports an exit, `is_alive` stays false forever.

use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::RouterError;
use crate::registry::ServiceDescriptor;

/// Minimal control surface over one supervised OS process.
pub trait ProcessControl: Send {
    /// OS process id.
    fn pid(&self) -> u32;

    /// True until the child is confirmed exited.
    fn is_alive(&self) -> bool;

    /// Non-blocking reap; returns `true` the first time an exit is observed.
    fn try_reap(&mut self) -> bool;

    /// Platform interrupt (SIGINT on unix), the middle escalation step.
    fn interrupt(&mut self);

    /// Force-kill, the final escalation step.
    fn terminate(&mut self);
}

/// [`ProcessControl`] over a spawned [`tokio::process::Child`].
pub struct ChildProcess {
    child: Child,
    pid: u32,
    exited: bool,
}

impl ChildProcess {
    fn new(child: Child) -> Self {
        let pid = child.id().unwrap_or_default();
        Self {
            child,
            pid,
            exited: false,
        }
    }
}

impl ProcessControl for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        !self.exited
    }

    fn try_reap(&mut self) -> bool {
        if self.exited {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(_status)) => {
                self.exited = true;
                true
            }
            Ok(None) => false,
            // The handle is unusable; treat the child as gone rather than
            // probing it forever.
            Err(_) => {
                self.exited = true;
                true
            }
        }
    }

    #[cfg(unix)]
    fn interrupt(&mut self) {
        if self.exited || self.pid == 0 {
            return;
        }
        // SAFETY: pid is a child we spawned and have not reaped; SIGINT
        // requests interruption.
        unsafe {
            libc::kill(self.pid as i32, libc::SIGINT);
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) {
        // No portable interrupt; escalation proceeds straight to terminate.
    }

    fn terminate(&mut self) {
        if !self.exited {
            let _ = self.child.start_kill();
        }
    }
}

/// Launch seam between the fleet handlers and the OS. Tests substitute a
/// recording fake, the same way [`ProcessControl`] is faked.
pub trait ServiceLauncher: Send + Sync {
    fn launch(
        &self,
        descriptor: &ServiceDescriptor,
        service_root: &std::path::Path,
        port: u16,
        router_port: u16,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn ProcessControl>, RouterError>;
}

/// [`ServiceLauncher`] that spawns real service children.
pub struct SpawnLauncher;

impl ServiceLauncher for SpawnLauncher {
    fn launch(
        &self,
        descriptor: &ServiceDescriptor,
        service_root: &std::path::Path,
        port: u16,
        router_port: u16,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn ProcessControl>, RouterError> {
        launch(descriptor, service_root, port, router_port, extra_env)
    }
}

/// Spawns a service child under the launch contract:
/// `--id <id> --port <assigned> --testbed_port <router-port>`, plus the
/// descriptor's environment overrides.
pub fn launch(
    descriptor: &ServiceDescriptor,
    service_root: &std::path::Path,
    port: u16,
    router_port: u16,
    extra_env: &BTreeMap<String, String>,
) -> Result<Box<dyn ProcessControl>, RouterError> {
    let executable = descriptor
        .executable
        .clone()
        .unwrap_or_else(|| {
            service_root
                .join(&descriptor.service_type)
                .to_string_lossy()
                .into_owned()
        });

    let mut command = Command::new(executable);
    command
        .arg("--id")
        .arg(&descriptor.id)
        .arg("--port")
        .arg(port.to_string())
        .arg("--testbed_port")
        .arg(router_port.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(false);
    for (key, value) in extra_env.iter().chain(descriptor.env.iter()) {
        command.env(key, value);
    }

    let child = command.spawn().map_err(|source| RouterError::Launch {
        id: descriptor.id.clone(),
        source,
    })?;
    Ok(Box::new(ChildProcess::new(child)))
}
