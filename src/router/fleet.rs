//! Fleet-management handlers: the requests the supervisor answers itself.
//!
//! Covers ensure-started (`require_service`), the running-services view,
//! experiment bookkeeping (`start_new_experiment` / `end_experiment`,
//! `output_path`), the simulation flag, and the merged configuration tree.
//!
//! ## Rules
//! - `require_service` is idempotent: a live service is a no-op returning
//!   the current status triple.
//! - Declared dependencies are pre-started best-effort; an individual
//!   dependency-start failure is logged, never escalated.
//! - Ports are allocated on demand and never reused while the owning
//!   reference is live.
//! - Experiment ids only ever increase; the output directory is templated
//!   from simulation mode, timestamp, experiment name, and the id.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::Config;
use crate::error::RouterError;
use crate::events::{Bus, Event, EventKind};
use crate::process::{ServiceLauncher, SpawnLauncher};
use crate::protocol::messages::{Reply, Request, RequireService, ServiceStatus, StartNewExperiment};
use crate::registry::{ServiceReference, ServiceRegistry, ServiceState};

/// Mutable fleet state owned by the router task.
pub struct Fleet {
    cfg: Config,
    registry: Arc<ServiceRegistry>,
    bus: Bus,
    launcher: Arc<dyn ServiceLauncher>,
    next_port: u16,
    experiment_id: u64,
    current_output: Option<PathBuf>,
}

impl Fleet {
    pub fn new(cfg: Config, registry: Arc<ServiceRegistry>, bus: Bus) -> Self {
        Self::with_launcher(cfg, registry, bus, Arc::new(SpawnLauncher))
    }

    /// Constructor with an explicit launch seam, used by tests.
    pub fn with_launcher(
        cfg: Config,
        registry: Arc<ServiceRegistry>,
        bus: Bus,
        launcher: Arc<dyn ServiceLauncher>,
    ) -> Self {
        let next_port = cfg.base_service_port;
        Self {
            cfg,
            registry,
            bus,
            launcher,
            next_port,
            experiment_id: 0,
            current_output: None,
        }
    }

    /// Answers one fleet request. Every outcome is a [`Reply`]; failures are
    /// normalized to string descriptions.
    pub fn handle(&mut self, request: &Request) -> Reply {
        let rt = request.request_type.as_str();
        match rt {
            "require_service" => self.require_service(rt, &request.data),
            "running_services" => self.running_services(rt),
            "start_new_experiment" => self.start_new_experiment(rt, &request.data),
            "end_experiment" => {
                self.current_output = None;
                Reply::ok(rt, json!({ "output_path": self.output_path() }))
            }
            "output_path" => Reply::ok(rt, json!({ "output_path": self.output_path() })),
            "is_simulated" => Reply::ok(rt, json!({ "is_simulated": self.cfg.simulated })),
            "configuration" => Reply::ok(rt, self.cfg.tree.clone()),
            other => Reply::error(other, format!("unknown request type '{other}'")),
        }
    }

    fn require_service(&mut self, rt: &str, data: &Value) -> Reply {
        let body: RequireService = match serde_json::from_value(data.clone()) {
            Ok(b) => b,
            Err(e) => return Reply::error(rt, format!("malformed request body: {e}")),
        };
        let Some(reference) = self.registry.get(&body.service_name) else {
            return Reply::error(rt, format!("unknown service '{}'", body.service_name));
        };

        // Best-effort dependency pre-start: failures are logged, not
        // escalated.
        for dep in reference.dependencies.clone() {
            if let Some(dep_ref) = self.registry.get(&dep) {
                if let Err(e) = self.ensure_started(&dep_ref) {
                    warn!(
                        service = dep.as_str(),
                        error = %e,
                        "dependency start failed; continuing"
                    );
                }
            }
        }

        if let Err(e) = self.ensure_started(&reference) {
            return Reply::error(rt, e.to_string());
        }
        Reply::ok(
            rt,
            serde_json::to_value(self.status_of(&reference)).unwrap_or(Value::Null),
        )
    }

    /// Launches the service unless it is already live.
    fn ensure_started(&mut self, reference: &Arc<ServiceReference>) -> Result<(), RouterError> {
        if reference.state().is_live() {
            return Ok(());
        }

        let port = self.allocate_port();
        let process = self.launcher.launch(
            reference.descriptor(),
            &self.cfg.service_root,
            port,
            self.cfg.port,
            &self.cfg.base_env,
        )?;
        reference.set_assigned_port(port);
        reference.attach_process(process);
        reference.set_state(ServiceState::Initializing);
        self.bus.publish(
            Event::now(EventKind::ServiceLaunched)
                .with_service(reference.id())
                .with_state(ServiceState::Initializing),
        );
        Ok(())
    }

    /// Next free port. The counter only counts up, so a port is never
    /// reused while (or after) its owner is live.
    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(port);
        port
    }

    fn status_of(&self, reference: &ServiceReference) -> ServiceStatus {
        ServiceStatus {
            service_name: reference.id().to_string(),
            service_type: reference.service_type().to_string(),
            is_connected: reference.is_connected(),
            is_open: reference.is_open(),
        }
    }

    fn running_services(&self, rt: &str) -> Reply {
        let mut map = serde_json::Map::new();
        for reference in self.registry.iter() {
            if reference.state().is_live() {
                map.insert(
                    reference.id().to_string(),
                    serde_json::to_value(self.status_of(reference)).unwrap_or(Value::Null),
                );
            }
        }
        Reply::ok(rt, Value::Object(map))
    }

    fn start_new_experiment(&mut self, rt: &str, data: &Value) -> Reply {
        let body: StartNewExperiment = match serde_json::from_value(data.clone()) {
            Ok(b) => b,
            Err(e) => return Reply::error(rt, format!("malformed request body: {e}")),
        };

        self.experiment_id += 1;
        let mode = if self.cfg.simulated { "sim" } else { "hw" };
        let stamp = Local::now().format("%Y-%m-%dT%H-%M-%S");
        let dir = self.cfg.output_root.join(format!(
            "{mode}_{stamp}_{id:04}_{name}",
            id = self.experiment_id,
            name = sanitize(&body.experiment_name),
        ));

        if let Err(e) = self.persist_experiment(&dir, &body.metadata) {
            return Reply::error(rt, e.to_string());
        }
        self.current_output = Some(dir.clone());
        Reply::ok(rt, json!({ "output_path": dir.display().to_string() }))
    }

    /// Writes the merged configuration and launch metadata into the new
    /// experiment directory.
    fn persist_experiment(&self, dir: &PathBuf, metadata: &Value) -> Result<(), RouterError> {
        let persist = |source: std::io::Error| RouterError::Persist {
            path: dir.display().to_string(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(persist)?;

        let config_json =
            serde_json::to_vec_pretty(&self.cfg.tree).unwrap_or_else(|_| b"null".to_vec());
        std::fs::write(dir.join("configuration.json"), config_json).map_err(persist)?;

        let meta = json!({
            "metadata": metadata,
            "experiment_id": self.experiment_id,
            "simulated": self.cfg.simulated,
        });
        let meta_json = serde_json::to_vec_pretty(&meta).unwrap_or_else(|_| b"null".to_vec());
        std::fs::write(dir.join("metadata.json"), meta_json).map_err(persist)?;
        Ok(())
    }

    fn output_path(&self) -> String {
        self.current_output
            .as_ref()
            .unwrap_or(&self.cfg.output_root)
            .display()
            .to_string()
    }
}

/// Directory-safe rendition of an experiment name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
