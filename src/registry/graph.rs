//! Dependency graph over service ids.
//!
//! Built once at registry construction: a forward edge per declared
//! dependency and the reverse `depended_on_by` edge; `requires_safety` adds
//! an implicit dependency on the configured safety service, participating in
//! cycle detection identically to explicit edges.
//!
//! ```text
//! camera:  deps = [safety]          safety.depended_on_by = [camera, dm]
//! dm:      deps = [safety, camera]  camera.depended_on_by = [dm]
//! ```
//!
//! ## Rules
//! - Unknown referenced ids and a missing safety service are fatal
//!   configuration errors.
//! - Acyclicity is verified by iteratively peeling nodes whose dependents
//!   are all already removed; failure to make progress names the remainder.
//! - During shutdown a service may be stopped only once every entry in its
//!   `depended_on_by` has left the live set.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::ConfigError;
use crate::registry::ServiceDescriptor;

/// Immutable "requires" DAG among services.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// id → ids it depends on.
    forward: BTreeMap<String, BTreeSet<String>>,
    /// id → ids depending on it.
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Builds and validates the graph, including implicit safety edges.
    pub fn build(
        descriptors: &[ServiceDescriptor],
        safety_service: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let known: BTreeSet<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();

        let mut forward: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut reverse: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for d in descriptors {
            forward.entry(d.id.clone()).or_default();
            reverse.entry(d.id.clone()).or_default();
        }

        for d in descriptors {
            let mut deps: BTreeSet<String> = d.dependencies.iter().cloned().collect();
            if d.requires_safety {
                let safety = safety_service.ok_or_else(|| ConfigError::MissingSafetyService {
                    id: d.id.clone(),
                })?;
                if safety != d.id {
                    deps.insert(safety.to_string());
                }
            }

            for dep in deps {
                if !known.contains(dep.as_str()) {
                    return Err(ConfigError::UnknownService {
                        id: dep,
                        referenced_by: d.id.clone(),
                    });
                }
                if dep == d.id {
                    // A self-edge is the smallest cycle.
                    return Err(ConfigError::DependencyCycle {
                        remainder: vec![d.id.clone()],
                    });
                }
                reverse.entry(dep.clone()).or_default().insert(d.id.clone());
                forward.entry(d.id.clone()).or_default().insert(dep);
            }
        }

        let graph = Self { forward, reverse };
        graph.verify_acyclic()?;
        Ok(graph)
    }

    /// Peels nodes whose dependents are all removed until the graph is
    /// empty; a stuck remainder is a cycle and is named in the error.
    fn verify_acyclic(&self) -> Result<(), ConfigError> {
        let mut remaining: BTreeSet<&str> = self.forward.keys().map(String::as_str).collect();

        loop {
            let peelable: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    self.reverse[*id]
                        .iter()
                        .all(|dependent| !remaining.contains(dependent.as_str()))
                })
                .collect();

            if peelable.is_empty() {
                if remaining.is_empty() {
                    return Ok(());
                }
                return Err(ConfigError::DependencyCycle {
                    remainder: remaining.iter().map(|s| s.to_string()).collect(),
                });
            }
            for id in peelable {
                remaining.remove(id);
            }
        }
    }

    /// Ids the given service depends on.
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        self.forward
            .get(id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids depending on the given service.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.reverse
            .get(id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Shutdown-safety predicate: every dependent has left the live set.
    pub fn may_stop(&self, id: &str, live: &HashSet<String>) -> bool {
        self.reverse
            .get(id)
            .map(|dependents| dependents.iter().all(|d| !live.contains(d)))
            .unwrap_or(true)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.forward.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors(edges: &[(&str, &[&str])]) -> Vec<ServiceDescriptor> {
        edges.iter()
            .map(|(id, deps)| {
                let mut d = ServiceDescriptor::new(*id, "sim");
                for dep in *deps {
                    d = d.with_dependency(*dep);
                }
                d
            })
            .collect()
    }

    #[test]
    fn builds_forward_and_reverse_edges() {
        let g = DependencyGraph::build(&descriptors(&[("a", &[]), ("b", &["a"])]), None).unwrap();
        assert_eq!(g.dependencies_of("b"), vec!["a".to_string()]);
        assert_eq!(g.dependents_of("a"), vec!["b".to_string()]);
        assert!(g.dependents_of("b").is_empty());
    }

    #[test]
    fn cycle_is_fatal_and_names_a_member() {
        let err = DependencyGraph::build(
            &descriptors(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &[])]),
            None,
        )
        .unwrap_err();
        match err {
            ConfigError::DependencyCycle { remainder } => {
                for id in ["a", "b", "c"] {
                    assert!(remainder.contains(&id.to_string()), "missing {id}");
                }
                assert!(!remainder.contains(&"d".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = DependencyGraph::build(&descriptors(&[("a", &["a"])]), None).unwrap_err();
        assert_eq!(err.as_label(), "config_dependency_cycle");
    }

    #[test]
    fn unknown_dependency_is_fatal() {
        let err = DependencyGraph::build(&descriptors(&[("a", &["ghost"])]), None).unwrap_err();
        assert_eq!(err.as_label(), "config_unknown_service");
    }

    #[test]
    fn requires_safety_adds_an_implicit_edge() {
        let mut ds = descriptors(&[("safety", &[]), ("camera", &[])]);
        ds[1].requires_safety = true;
        let g = DependencyGraph::build(&ds, Some("safety")).unwrap();
        assert_eq!(g.dependents_of("safety"), vec!["camera".to_string()]);
    }

    #[test]
    fn requires_safety_without_safety_service_is_fatal() {
        let mut ds = descriptors(&[("camera", &[])]);
        ds[0].requires_safety = true;
        let err = DependencyGraph::build(&ds, None).unwrap_err();
        assert_eq!(err.as_label(), "config_missing_safety");
    }

    #[test]
    fn safety_edges_participate_in_cycle_detection() {
        // safety depends on camera; camera requires safety → cycle.
        let mut ds = descriptors(&[("safety", &["camera"]), ("camera", &[])]);
        ds[1].requires_safety = true;
        let err = DependencyGraph::build(&ds, Some("safety")).unwrap_err();
        assert_eq!(err.as_label(), "config_dependency_cycle");
    }

    #[test]
    fn may_stop_waits_for_dependents_to_leave_the_live_set() {
        let g = DependencyGraph::build(&descriptors(&[("a", &[]), ("b", &["a"])]), None).unwrap();
        let mut live: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert!(g.may_stop("b", &live), "nothing depends on b");
        assert!(!g.may_stop("a", &live), "b still live");
        live.remove("b");
        assert!(g.may_stop("a", &live));
    }
}
