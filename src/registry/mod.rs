//! Service registry: descriptors, runtime references, and the dependency graph.
//!
//! The registry is an arena of [`ServiceReference`]s keyed by stable id,
//! built **once** from the configured descriptors; restarts reuse the same
//! reference. Topology never changes after construction: only the router
//! process owns the registry, and background loops (monitor, sequencer) see
//! references through `Arc`s with mutex-guarded fields.
//!
//! ## Contents
//! - [`ServiceDescriptor`] — static, config-derived definition
//! - [`ServiceReference`] / [`ServiceState`] — runtime record + state machine
//! - [`DependencyGraph`] — "requires" DAG with peeling cycle check

mod descriptor;
mod graph;
mod reference;

pub use descriptor::ServiceDescriptor;
pub use graph::DependencyGraph;
pub use reference::{Identity, PendingRequest, ServiceReference, ServiceState};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::ConfigError;

/// Arena of one [`ServiceReference`] per configured service.
pub struct ServiceRegistry {
    references: BTreeMap<String, Arc<ServiceReference>>,
    graph: DependencyGraph,
}

impl ServiceRegistry {
    /// Builds the registry: graph construction, cycle check, and one
    /// reference per descriptor with its computed edges.
    pub fn build(
        descriptors: Vec<ServiceDescriptor>,
        safety_service: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let graph = DependencyGraph::build(&descriptors, safety_service)?;

        let mut references = BTreeMap::new();
        for descriptor in descriptors {
            let id = descriptor.id.clone();
            let reference = ServiceReference::new(
                descriptor,
                graph.dependencies_of(&id),
                graph.dependents_of(&id),
            );
            references.insert(id, Arc::new(reference));
        }
        Ok(Self { references, graph })
    }

    /// Looks up a reference by id.
    pub fn get(&self, id: &str) -> Option<Arc<ServiceReference>> {
        self.references.get(id).cloned()
    }

    /// All references, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceReference>> {
        self.references.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.references.keys().map(String::as_str)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Ids whose process has not been confirmed gone. This is the shutdown
    /// sequencer's initial live set.
    pub fn live_set(&self) -> HashSet<String> {
        self.references
            .iter()
            .filter(|(_, r)| r.with_process(|p| p.is_alive()).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_one_reference_per_descriptor_with_edges() {
        let registry = ServiceRegistry::build(
            vec![
                ServiceDescriptor::new("a", "sim"),
                ServiceDescriptor::new("b", "sim").with_dependency("a"),
            ],
            None,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        let a = registry.get("a").unwrap();
        assert_eq!(a.depended_on_by, vec!["b".to_string()]);
        let b = registry.get("b").unwrap();
        assert_eq!(b.dependencies, vec!["a".to_string()]);
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn construction_fails_on_a_cycle() {
        let err = ServiceRegistry::build(
            vec![
                ServiceDescriptor::new("a", "sim").with_dependency("b"),
                ServiceDescriptor::new("b", "sim").with_dependency("a"),
            ],
            None,
        )
        .err()
        .unwrap();
        assert_eq!(err.as_label(), "config_dependency_cycle");
    }

    #[test]
    fn the_same_reference_is_reused_across_lookups() {
        let registry =
            ServiceRegistry::build(vec![ServiceDescriptor::new("a", "sim")], None).unwrap();
        let first = registry.get("a").unwrap();
        let second = registry.get("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
