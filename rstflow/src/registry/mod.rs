//! Stage registry.
//!
//! The registry is the declarative table of processing stages. It is
//! loaded once at startup, validated (no dangling predecessors, no cycles)
//! and then shared read-only as `Arc<StageRegistry>`.
//!
//! Adding a stage is a configuration change: every stage is data, and the
//! executor treats all of them the same way.

mod defaults;
mod descriptor;

pub use defaults::{rst_descriptors, FitAlgorithm, DESPECK_METRIC_PATTERN};
pub use descriptor::{ArgTemplate, OutputMode, StageConfig, StageDescriptor, BUILTIN_PLACEHOLDERS};

use crate::config::Toolkit;
use crate::errors::{ConfigurationError, PlanningError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Read-only table of stage descriptors.
#[derive(Debug, Default)]
pub struct StageRegistry {
    /// Descriptors by name.
    stages: HashMap<String, Arc<StageDescriptor>>,
    /// Names in definition order.
    order: Vec<String>,
    /// Direct successors of each stage.
    children: HashMap<String, Vec<String>>,
}

impl StageRegistry {
    /// Builds a registry from stage configuration, resolving executables
    /// against the toolkit.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if a binary is missing or the stage
    /// graph is invalid.
    pub fn load(configs: Vec<StageConfig>, toolkit: &Toolkit) -> Result<Self, ConfigurationError> {
        let descriptors = configs
            .into_iter()
            .map(|config| config.into_descriptor(Some(toolkit)))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_descriptors(descriptors)
    }

    /// Builds a registry from descriptors, validating the graph.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid descriptors, duplicate names, dangling
    /// predecessors or cycles.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = StageDescriptor>,
    ) -> Result<Self, ConfigurationError> {
        let mut registry = Self::default();

        for descriptor in descriptors {
            descriptor.validate()?;
            if registry.stages.contains_key(&descriptor.name) {
                return Err(ConfigurationError::DuplicateStage {
                    name: descriptor.name,
                });
            }
            registry.order.push(descriptor.name.clone());
            registry
                .stages
                .insert(descriptor.name.clone(), Arc::new(descriptor));
        }

        for name in &registry.order {
            let stage = &registry.stages[name];
            if let Some(predecessor) = stage.predecessor.as_ref() {
                if !registry.stages.contains_key(predecessor) {
                    return Err(ConfigurationError::DanglingPredecessor {
                        stage: name.clone(),
                        predecessor: predecessor.clone(),
                    });
                }
                registry
                    .children
                    .entry(predecessor.clone())
                    .or_default()
                    .push(name.clone());
            }
        }

        for name in &registry.order {
            if let Err(PlanningError::CyclicDependency { path }) = registry.dependency_chain(name) {
                return Err(ConfigurationError::CyclicRegistry { path });
            }
        }

        debug!(stages = registry.order.len(), "Stage registry loaded");
        Ok(registry)
    }

    /// Returns the descriptor for `stage_name`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if no such stage is registered.
    pub fn resolve(&self, stage_name: &str) -> Result<Arc<StageDescriptor>, PlanningError> {
        self.stages
            .get(stage_name)
            .cloned()
            .ok_or_else(|| PlanningError::unknown_stage(stage_name))
    }

    /// Returns the chain from the earliest ancestor to `stage_name`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` for an unresolved link and `CyclicDependency`
    /// if the walk revisits a stage.
    pub fn dependency_chain(&self, stage_name: &str) -> Result<Vec<Arc<StageDescriptor>>, PlanningError> {
        let mut chain = Vec::new();
        let mut path: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(stage_name.to_string());

        while let Some(name) = current {
            path.push(name.clone());
            if !seen.insert(name.clone()) {
                path.reverse();
                return Err(PlanningError::CyclicDependency { path });
            }
            let stage = self.resolve(&name)?;
            current = stage.predecessor.clone();
            chain.push(stage);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Returns every stage transitively downstream of `stage_name`,
    /// nearest first.
    #[must_use]
    pub fn descendants(&self, stage_name: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([stage_name]);

        while let Some(name) = queue.pop_front() {
            for child in self.children.get(name).into_iter().flatten() {
                if seen.insert(child.as_str()) {
                    out.push(child.clone());
                    queue.push_back(child);
                }
            }
        }
        out
    }

    /// Returns the stage names in definition order.
    #[must_use]
    pub fn stage_names(&self) -> &[String] {
        &self.order
    }

    /// Iterates over descriptors in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<StageDescriptor>> {
        self.order.iter().map(|name| &self.stages[name])
    }

    /// Returns true if `stage_name` is registered.
    #[must_use]
    pub fn contains(&self, stage_name: &str) -> bool {
        self.stages.contains_key(stage_name)
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stages are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(chain: &[Arc<StageDescriptor>]) -> Vec<&str> {
        chain.iter().map(|s| s.name.as_str()).collect()
    }

    fn linear() -> StageRegistry {
        StageRegistry::from_descriptors([
            StageDescriptor::source("raw", "dat"),
            StageDescriptor::tool("filtered", "raw", "/bin/filter", "filtered"),
            StageDescriptor::tool("fitted", "filtered", "/bin/fit", "fitted"),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve() {
        let registry = linear();
        assert_eq!(registry.resolve("filtered").unwrap().name, "filtered");
        assert_eq!(
            registry.resolve("nope").unwrap_err(),
            PlanningError::unknown_stage("nope")
        );
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("raw"));
    }

    #[test]
    fn test_dependency_chain_order() {
        let registry = linear();
        assert_eq!(names(&registry.dependency_chain("fitted").unwrap()), vec!["raw", "filtered", "fitted"]);
        assert_eq!(names(&registry.dependency_chain("raw").unwrap()), vec!["raw"]);
    }

    #[test]
    fn test_dependency_chain_detects_cycle() {
        // Bypasses load-time validation to exercise the traversal guard.
        let mut registry = StageRegistry::default();
        for (name, pred) in [("a", "b"), ("b", "a")] {
            registry.order.push(name.to_string());
            registry.stages.insert(
                name.to_string(),
                Arc::new(StageDescriptor::tool(name, pred, "/bin/x", name)),
            );
        }

        match registry.dependency_chain("a") {
            Err(PlanningError::CyclicDependency { path }) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 3);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_cycle() {
        let err = StageRegistry::from_descriptors([
            StageDescriptor::source("raw", "dat"),
            StageDescriptor::tool("a", "b", "/bin/x", "a"),
            StageDescriptor::tool("b", "a", "/bin/x", "b"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::CyclicRegistry { .. }));
    }

    #[test]
    fn test_load_rejects_dangling_and_duplicates() {
        let err = StageRegistry::from_descriptors([StageDescriptor::tool("a", "ghost", "/bin/x", "a")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::DanglingPredecessor { .. }));

        let err = StageRegistry::from_descriptors([
            StageDescriptor::source("raw", "dat"),
            StageDescriptor::source("raw", "dat"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateStage { .. }));
    }

    #[test]
    fn test_descendants() {
        let registry = StageRegistry::from_descriptors([
            StageDescriptor::source("raw", "dat"),
            StageDescriptor::tool("filtered", "raw", "/bin/filter", "filtered"),
            StageDescriptor::tool("fitted", "filtered", "/bin/fit", "fitted"),
            StageDescriptor::tool("map", "fitted", "/bin/map", "map"),
            StageDescriptor::tool("summary", "raw", "/bin/sum", "summary"),
        ])
        .unwrap();

        assert_eq!(registry.descendants("filtered"), vec!["fitted", "map"]);
        assert_eq!(registry.descendants("raw"), vec!["filtered", "summary", "fitted", "map"]);
        assert!(registry.descendants("map").is_empty());
    }
}
