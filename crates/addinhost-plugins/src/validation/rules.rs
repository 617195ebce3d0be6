use super::{ValidationResult, ValidationRule};
use crate::{DependencyInfo, PluginDescriptor};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// The plugin's assembly must exist and be a regular file
#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblyExistsRule;

#[async_trait]
impl ValidationRule for AssemblyExistsRule {
    fn name(&self) -> &str {
        "assembly"
    }

    async fn validate(&self, descriptor: &PluginDescriptor) -> ValidationResult {
        match tokio::fs::metadata(&descriptor.assembly_path).await {
            Ok(metadata) if metadata.is_file() => ValidationResult::success(),
            Ok(_) => ValidationResult::failure(format!(
                "Assembly {} is not a file",
                descriptor.assembly_path.display()
            )),
            Err(_) => ValidationResult::failure(format!(
                "Assembly {} not found",
                descriptor.assembly_path.display()
            )),
        }
    }
}

/// The manifest must carry a parsable version
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionRule;

#[async_trait]
impl ValidationRule for VersionRule {
    fn name(&self) -> &str {
        "version"
    }

    async fn validate(&self, descriptor: &PluginDescriptor) -> ValidationResult {
        match descriptor.version {
            Some(_) => ValidationResult::success(),
            None => ValidationResult::failure(format!(
                "Plugin '{}' has a missing or invalid version",
                descriptor.id
            )),
        }
    }
}

/// Checks declared dependencies against a snapshot of the available plugins.
///
/// Cycle detection here is independent of the dependency graph so a plugin
/// can be validated before it is added to one.
#[derive(Debug, Clone, Default)]
pub struct DependencyRule {
    available: HashMap<String, PluginDescriptor>,
}

impl DependencyRule {
    pub fn new(available: impl IntoIterator<Item = PluginDescriptor>) -> Self {
        Self {
            available: available
                .into_iter()
                .map(|descriptor| (descriptor.id.clone(), descriptor))
                .collect(),
        }
    }

    fn check_dependency(&self, dependency: &DependencyInfo) -> Option<String> {
        let Some(found) = self.available.get(&dependency.plugin_id) else {
            return (!dependency.is_optional)
                .then(|| format!("Required dependency '{}' not found", dependency.plugin_id));
        };

        match found.version {
            None => Some(format!(
                "Dependency '{}' has no version to check against {}",
                dependency.plugin_id, dependency.version_range
            )),
            Some(version) if !dependency.version_range.is_in_range(&version) => Some(format!(
                "Dependency '{}' version {} is outside required range {}",
                dependency.plugin_id, version, dependency.version_range
            )),
            Some(_) => None,
        }
    }

    /// Depth-first search for any back-edge reachable from the plugin.
    /// `stack` holds the current path; `done` holds fully explored plugins.
    fn find_cycle(
        &self,
        dependencies: &[DependencyInfo],
        stack: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        for dependency in dependencies {
            let id = &dependency.plugin_id;
            if let Some(start) = stack.iter().position(|on_stack| on_stack == id) {
                let mut cycle = stack[start..].to_vec();
                cycle.push(id.clone());
                return Some(cycle);
            }
            if done.contains(id) {
                continue;
            }
            let Some(next) = self.available.get(id) else {
                continue;
            };

            stack.push(id.clone());
            if let Some(cycle) = self.find_cycle(&next.dependencies, stack, done) {
                return Some(cycle);
            }
            stack.pop();
            done.insert(id.clone());
        }
        None
    }
}

#[async_trait]
impl ValidationRule for DependencyRule {
    fn name(&self) -> &str {
        "dependency"
    }

    async fn validate(&self, descriptor: &PluginDescriptor) -> ValidationResult {
        let mut errors: Vec<String> = descriptor
            .dependencies
            .iter()
            .filter_map(|dependency| self.check_dependency(dependency))
            .collect();

        let mut stack = vec![descriptor.id.clone()];
        let mut done = HashSet::new();
        if let Some(cycle) = self.find_cycle(&descriptor.dependencies, &mut stack, &mut done) {
            errors.push(format!("Circular dependency: {}", cycle.join(" -> ")));
        }

        ValidationResult::from_errors(errors)
    }
}

type CheckFn = dyn Fn(&PluginDescriptor) -> ValidationResult + Send + Sync;

/// Rule backed by a closure
pub struct CustomRule {
    name: String,
    check: Box<CheckFn>,
}

impl CustomRule {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&PluginDescriptor) -> ValidationResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }
}

impl std::fmt::Debug for CustomRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomRule").field("name", &self.name).finish()
    }
}

#[async_trait]
impl ValidationRule for CustomRule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, descriptor: &PluginDescriptor) -> ValidationResult {
        (self.check)(descriptor)
    }
}
