//! Service dependency ordering
//!
//! Declared dependencies form a directed graph that must be acyclic. The
//! graph is layered with Kahn's algorithm: every service in layer N depends
//! only on services in layers 0..N-1. The flattened layers give a stable
//! report order; readiness checks themselves start per service as soon as
//! its own dependencies have finished.

mod validator;

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::ServiceDependency;
use crate::{Error, Result};

pub use self::validator::{DependencyGraphValidator, ServiceResult, ServiceStatus};

/// Acyclic service dependency graph
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    services: BTreeMap<String, ServiceDependency>,
    layers: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build and order the graph.
    ///
    /// Fails with [`Error::DependencyCycle`] naming the services on the
    /// cycle, or [`Error::Validation`] if an edge points at an undeclared
    /// service.
    pub fn build(dependencies: &[ServiceDependency]) -> Result<Self> {
        let mut services = BTreeMap::new();
        for dep in dependencies {
            if services.insert(dep.id.clone(), dep.clone()).is_some() {
                return Err(Error::validation(format!(
                    "service '{}' is declared more than once",
                    dep.id
                )));
            }
        }

        for dep in dependencies {
            for upstream in &dep.depends_on {
                if !services.contains_key(upstream) {
                    return Err(Error::validation(format!(
                        "service '{}' depends on undeclared service '{}'",
                        dep.id, upstream
                    )));
                }
            }
        }

        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut layers: Vec<Vec<String>> = Vec::new();

        while placed.len() < services.len() {
            let layer: Vec<String> = services
                .values()
                .filter(|s| !placed.contains(s.id.as_str()))
                .filter(|s| s.depends_on.iter().all(|d| placed.contains(d.as_str())))
                .map(|s| s.id.clone())
                .collect();

            if layer.is_empty() {
                let stuck: BTreeSet<&str> = services
                    .keys()
                    .map(String::as_str)
                    .filter(|id| !placed.contains(id))
                    .collect();
                return Err(Error::DependencyCycle(find_cycle(&services, &stuck)));
            }

            debug!(layer = layers.len(), services = ?layer, "Computed dependency layer");
            placed.extend(
                layer
                    .iter()
                    .filter_map(|id| services.get_key_value(id).map(|(k, _)| k.as_str())),
            );
            layers.push(layer);
        }

        Ok(Self { services, layers })
    }

    /// Services grouped by layer
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Flattened order consistent with every declared edge
    pub fn order(&self) -> Vec<String> {
        self.layers.iter().flatten().cloned().collect()
    }

    /// Look up a declared service
    pub fn service(&self, id: &str) -> Option<&ServiceDependency> {
        self.services.get(id)
    }

    /// Number of declared services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are declared
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Walk dependency edges among the services Kahn's algorithm could not
/// place until a service repeats; returns the cycle with its first service
/// repeated at the end.
fn find_cycle(services: &BTreeMap<String, ServiceDependency>, stuck: &BTreeSet<&str>) -> Vec<String> {
    // Every stuck service has at least one stuck dependency, so the walk
    // never dead-ends.
    let Some(&start) = stuck.iter().next() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = services[current]
            .depends_on
            .iter()
            .map(String::as_str)
            .find(|d| stuck.contains(d));
        let Some(next) = next else {
            return path.iter().map(|s| s.to_string()).collect();
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
}
