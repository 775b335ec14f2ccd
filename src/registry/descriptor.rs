//! Static, config-derived definition of one service.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Immutable description of a supervised service, parsed from the
/// configuration file. One [`ServiceReference`](crate::registry::ServiceReference)
/// is materialized per descriptor for the registry's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Stable id the service is addressed by.
    pub id: String,
    /// Declared service type; also names the executable to launch.
    pub service_type: String,
    /// Ids of services this one depends on (start-before / stop-after).
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Adds an implicit dependency on the configured safety service.
    #[serde(default)]
    pub requires_safety: bool,
    /// Environment overrides applied to the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Optional executable override; defaults to the service type resolved
    /// under the configured service root.
    #[serde(default)]
    pub executable: Option<String>,
}

impl ServiceDescriptor {
    /// Minimal descriptor for tests and programmatic construction.
    pub fn new(id: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service_type: service_type.into(),
            dependencies: BTreeSet::new(),
            requires_safety: false,
            env: BTreeMap::new(),
            executable: None,
        }
    }

    /// Adds a declared dependency.
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    /// Marks the service as requiring the safety interlock.
    pub fn with_safety(mut self) -> Self {
        self.requires_safety = true;
        self
    }
}
