//! Builder for constructing a [`Supervisor`].
//!
//! Construction is where configuration errors surface: the dependency
//! graph is built and checked for cycles here, before anything binds or
//! spawns.

use std::sync::Arc;

use crate::config::Config;
use crate::error::ConfigError;
use crate::events::Bus;
use crate::registry::ServiceRegistry;
use crate::supervisor::Supervisor;

pub struct SupervisorBuilder {
    cfg: Config,
}

impl SupervisorBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Builds the supervisor: registry construction (with the acyclicity
    /// check), the event bus, and nothing else. Sockets are bound and
    /// loops spawned in [`Supervisor::run`].
    pub fn build(self) -> Result<Supervisor, ConfigError> {
        let registry = ServiceRegistry::build(
            self.cfg.services.clone(),
            self.cfg.safety_service.as_deref(),
        )?;
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        Ok(Supervisor::new_internal(self.cfg, Arc::new(registry), bus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_configuration_fails_at_build_time() {
        let cfg = Config::from_yaml(
            r#"
services:
  a:
    type: t
    dependencies: [b]
  b:
    type: t
    dependencies: [a]
"#,
        )
        .unwrap();
        let err = SupervisorBuilder::new(cfg).build().err().unwrap();
        assert_eq!(err.as_label(), "config_dependency_cycle");
    }

    #[test]
    fn valid_configuration_builds_a_registry() {
        let cfg = Config::from_yaml(
            r#"
safety_service: safety
services:
  safety:
    type: safety_monitor
  camera:
    type: sim_camera
    requires_safety: true
"#,
        )
        .unwrap();
        let sup = SupervisorBuilder::new(cfg).build().unwrap();
        assert_eq!(sup.registry().len(), 2);
    }
}
