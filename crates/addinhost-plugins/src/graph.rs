//! Plugin dependency graph and load ordering
//!
//! Edges point from a plugin to the plugins it depends on. Nodes keep
//! insertion order so the topological order is deterministic for a given
//! discovery order. Not synchronized; the host guards it with a lock.

use crate::{PluginDescriptor, PluginError};
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Circular dependency detected involving plugin '{0}'")]
    CircularDependency(String),
}

impl From<GraphError> for PluginError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CircularDependency(id) => PluginError::CircularDependency(id),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: IndexMap<String, PluginDescriptor>,
    dependencies: IndexMap<String, IndexSet<String>>,
    dependents: IndexMap<String, IndexSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a plugin node together with its declared dependency edges
    pub fn add_plugin(&mut self, descriptor: PluginDescriptor) {
        let id = descriptor.id.clone();
        let declared: Vec<String> = descriptor
            .dependencies
            .iter()
            .map(|dep| dep.plugin_id.clone())
            .collect();

        self.nodes.insert(id.clone(), descriptor);
        for dependency in declared {
            self.add_dependency(&id, &dependency);
        }
    }

    /// Record that `from` depends on `to`. Either end may be missing from the graph.
    pub fn add_dependency(&mut self, from: &str, to: &str) {
        self.dependencies
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.dependents
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
    }

    /// Remove a node and every edge touching it
    pub fn remove_plugin(&mut self, id: &str) -> Option<PluginDescriptor> {
        let removed = self.nodes.shift_remove(id);

        if let Some(targets) = self.dependencies.shift_remove(id) {
            for target in targets {
                if let Some(back) = self.dependents.get_mut(&target) {
                    back.shift_remove(id);
                    if back.is_empty() {
                        self.dependents.shift_remove(&target);
                    }
                }
            }
        }

        if let Some(sources) = self.dependents.shift_remove(id) {
            for source in sources {
                if let Some(forward) = self.dependencies.get_mut(&source) {
                    forward.shift_remove(id);
                    if forward.is_empty() {
                        self.dependencies.shift_remove(&source);
                    }
                }
            }
        }

        removed
    }

    pub fn get_plugin(&self, id: &str) -> Option<&PluginDescriptor> {
        self.nodes.get(id)
    }

    pub fn get_plugin_mut(&mut self, id: &str) -> Option<&mut PluginDescriptor> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Direct dependencies of `id`
    pub fn get_dependencies(&self, id: &str) -> Vec<String> {
        self.dependencies
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Plugins that depend directly on `id`
    pub fn get_dependents(&self, id: &str) -> Vec<String> {
        self.dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every plugin that depends on `id`, directly or not, nearest first
    pub fn get_all_dependents(&self, id: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::from([id]);
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        let mut ordered = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(direct) = self.dependents.get(current) else {
                continue;
            };
            for dependent in direct {
                if seen.insert(dependent.as_str()) {
                    ordered.push(dependent.clone());
                    queue.push_back(dependent.as_str());
                }
            }
        }

        ordered
    }

    /// Dependencies-first order of every node in the graph.
    ///
    /// Edges to plugins that are not nodes are followed but such plugins are
    /// not part of the result.
    pub fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for id in self.nodes.keys() {
            self.visit(id, &mut visiting, &mut visited, Some(&mut order))?;
        }

        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        visiting: &mut HashSet<&'a str>,
        visited: &mut HashSet<&'a str>,
        mut order: Option<&mut Vec<String>>,
    ) -> Result<(), GraphError> {
        if visited.contains(id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(GraphError::CircularDependency(id.to_string()));
        }

        if let Some(targets) = self.dependencies.get(id) {
            for target in targets {
                self.visit(target, visiting, visited, order.as_mut().map(|o| &mut **o))?;
            }
        }

        visiting.remove(id);
        visited.insert(id);
        if let Some(order) = order {
            if self.nodes.contains_key(id) {
                order.push(id.to_string());
            }
        }
        Ok(())
    }

    /// Cycle check that walks the graph without building an order
    pub fn has_cycle(&self) -> bool {
        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        self.nodes
            .keys()
            .any(|id| self.visit(id, &mut visiting, &mut visited, None).is_err())
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
