//! Global supervisor configuration.
//!
//! [`Config`] defines the supervisor's behavior: bind address, port
//! allocation base, liveness window and monitor tick, shutdown leniency,
//! client receive timeout, bus capacity, simulation mode, output paths, and
//! the per-service descriptor blocks.
//!
//! Configuration is loaded from a YAML file; the full parsed tree is kept
//! verbatim so `configuration{}` replies and per-service CONFIGURATION
//! slices can hand it out without re-reading the file.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use servisor::Config;
//!
//! let mut cfg = Config::default();
//! cfg.liveness_window = Duration::from_secs(5);
//! cfg.leniency = Duration::from_secs(10);
//! assert_eq!(cfg.supervisor_id, "supervisor");
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::registry::ServiceDescriptor;

/// Global configuration for the supervisor runtime.
#[derive(Clone, Debug)]
pub struct Config {
    /// Host the router binds and services connect back to.
    pub host: String,
    /// Router port.
    pub port: u16,
    /// Service name clients use to address the supervisor itself.
    pub supervisor_id: String,
    /// First port handed to launched services; allocation only counts up.
    pub base_service_port: u16,
    /// Maximum tolerated heartbeat age before a service is unresponsive.
    pub liveness_window: Duration,
    /// Liveness monitor poll tick.
    pub poll_tick: Duration,
    /// Router receive-loop poll timeout (shutdown flags are checked at this
    /// cadence).
    pub poll_timeout: Duration,
    /// Per-step leniency during shutdown escalation.
    pub leniency: Duration,
    /// Client/proxy receive timeout.
    pub receive_timeout: Duration,
    /// Capacity of the internal event bus.
    pub bus_capacity: usize,
    /// Whether the fleet runs against simulated hardware.
    pub simulated: bool,
    /// Root under which experiment output directories are created.
    pub output_root: PathBuf,
    /// Directory service executables are resolved under.
    pub service_root: PathBuf,
    /// Id of the safety service, if one is configured.
    pub safety_service: Option<String>,
    /// Environment applied to every launched service (before per-service
    /// overrides).
    pub base_env: BTreeMap<String, String>,
    /// Service descriptor blocks.
    pub services: Vec<ServiceDescriptor>,
    /// Full merged configuration tree, handed out verbatim.
    pub tree: Value,
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `host = 127.0.0.1`, `port = 7469`, `base_service_port = 7470`
    /// - `liveness_window = 5s`, `poll_tick = 200ms`, `poll_timeout = 100ms`
    /// - `leniency = 10s`, `receive_timeout = 30s`
    /// - `bus_capacity = 1024`, `simulated = false`
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7469,
            supervisor_id: "supervisor".into(),
            base_service_port: 7470,
            liveness_window: Duration::from_secs(5),
            poll_tick: Duration::from_millis(200),
            poll_timeout: Duration::from_millis(100),
            leniency: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(30),
            bus_capacity: 1024,
            simulated: false,
            output_root: PathBuf::from("output"),
            service_root: PathBuf::from("services"),
            safety_service: None,
            base_env: BTreeMap::new(),
            services: Vec::new(),
            tree: Value::Null,
        }
    }
}

/// Raw YAML shape; durations are written in milliseconds.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    supervisor_id: Option<String>,
    #[serde(default)]
    base_service_port: Option<u16>,
    #[serde(default)]
    liveness_window_ms: Option<u64>,
    #[serde(default)]
    poll_tick_ms: Option<u64>,
    #[serde(default)]
    poll_timeout_ms: Option<u64>,
    #[serde(default)]
    leniency_ms: Option<u64>,
    #[serde(default)]
    receive_timeout_ms: Option<u64>,
    #[serde(default)]
    bus_capacity: Option<usize>,
    #[serde(default)]
    simulated: Option<bool>,
    #[serde(default)]
    output_root: Option<PathBuf>,
    #[serde(default)]
    service_root: Option<PathBuf>,
    #[serde(default)]
    safety_service: Option<String>,
    #[serde(default)]
    base_env: BTreeMap<String, String>,
    #[serde(default)]
    services: BTreeMap<String, ServiceBlock>,
}

/// One `services:` block; the map key is the service id.
#[derive(Debug, Deserialize)]
struct ServiceBlock {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    requires_safety: bool,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    executable: Option<String>,
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&raw).map_err(|e| match e {
            ConfigError::Unreadable { reason, .. } => ConfigError::Unreadable {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(raw).map_err(|e| ConfigError::Unreadable {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?;
        let tree: Value = serde_yaml::from_str(raw)
            .map_err(|e| ConfigError::Unreadable {
                path: "<inline>".into(),
                reason: e.to_string(),
            })
            .map(|v: serde_yaml::Value| serde_json::to_value(v).unwrap_or(Value::Null))?;

        let defaults = Config::default();
        let services = file
            .services
            .into_iter()
            .map(|(id, block)| ServiceDescriptor {
                id,
                service_type: block.service_type,
                dependencies: block.dependencies.into_iter().collect(),
                requires_safety: block.requires_safety,
                env: block.env,
                executable: block.executable,
            })
            .collect();

        Ok(Self {
            host: file.host.unwrap_or(defaults.host),
            port: file.port.unwrap_or(defaults.port),
            supervisor_id: file.supervisor_id.unwrap_or(defaults.supervisor_id),
            base_service_port: file.base_service_port.unwrap_or(defaults.base_service_port),
            liveness_window: file
                .liveness_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.liveness_window),
            poll_tick: file
                .poll_tick_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_tick),
            poll_timeout: file
                .poll_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_timeout),
            leniency: file
                .leniency_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.leniency),
            receive_timeout: file
                .receive_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.receive_timeout),
            bus_capacity: file.bus_capacity.unwrap_or(defaults.bus_capacity),
            simulated: file.simulated.unwrap_or(defaults.simulated),
            output_root: file.output_root.unwrap_or(defaults.output_root),
            service_root: file.service_root.unwrap_or(defaults.service_root),
            safety_service: file.safety_service,
            base_env: file.base_env,
            services,
            tree,
        })
    }

    /// The configuration slice sent to one service at registration.
    pub fn service_slice(&self, id: &str) -> Value {
        self.tree
            .get("services")
            .and_then(|s| s.get(id))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Clamped bus capacity (minimum 1).
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
host: 127.0.0.1
port: 9000
simulated: true
liveness_window_ms: 2500
poll_timeout_ms: 50
safety_service: safety
services:
  safety:
    type: safety_monitor
  camera:
    type: sim_camera
    requires_safety: true
    dependencies: [safety]
    env:
      CAMERA_MODE: fast
"#;

    #[test]
    fn parses_descriptors_and_scalars() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.port, 9000);
        assert!(cfg.simulated);
        assert_eq!(cfg.liveness_window, Duration::from_millis(2500));
        assert_eq!(cfg.poll_timeout, Duration::from_millis(50));
        assert_eq!(cfg.safety_service.as_deref(), Some("safety"));

        assert_eq!(cfg.services.len(), 2);
        let camera = cfg.services.iter().find(|d| d.id == "camera").unwrap();
        assert_eq!(camera.service_type, "sim_camera");
        assert!(camera.requires_safety);
        assert_eq!(camera.env.get("CAMERA_MODE").unwrap(), "fast");
    }

    #[test]
    fn keeps_the_full_tree_for_configuration_replies() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        let slice = cfg.service_slice("camera");
        assert_eq!(slice["type"], "sim_camera");
        assert_eq!(cfg.service_slice("ghost"), Value::Null);
    }

    #[test]
    fn garbage_yaml_is_unreadable() {
        let err = Config::from_yaml(": not yaml : [").unwrap_err();
        assert_eq!(err.as_label(), "config_unreadable");
    }
}
