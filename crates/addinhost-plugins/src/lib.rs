//! Addinhost Plugin Runtime
//!
//! Loads third party plugins into a running host:
//! - Manifest parsing (JSON, YAML, XML) and recursive discovery
//! - Dependency graph with topological load ordering and cycle detection
//! - Validation pipeline (assembly, version, dependency, signature rules)
//! - Per-plugin load contexts with private dependency resolution and unload
//! - Permission grants, lifecycle state machine and host orchestration

pub mod activator;
pub mod admin;
pub mod context;
pub mod descriptor;
pub mod discovery;
pub mod graph;
pub mod host;
pub mod lifecycle;
pub mod load_context;
pub mod manifest;
pub mod permission;
pub mod validation;
pub mod version;

pub use activator::{
    LoadedPlugin, NativeActivator, Plugin, PluginActivator, PluginHandle, StaticActivator,
};
pub use admin::{AdminCommand, CommandResult, PluginAdministrator, PluginInfo};
pub use context::PluginContext;
pub use descriptor::{DependencyInfo, PluginDescriptor, PluginState};
pub use discovery::{DiscoveryFailure, DiscoveryReport, PluginDiscovery};
pub use graph::{DependencyGraph, GraphError};
pub use host::{LoadConcurrency, LoadReport, PluginHost, PluginMetrics};
pub use lifecycle::{LifecycleManager, LifecyclePhase};
pub use load_context::{
    LoadContextRegistry, LoadedUnit, PluginLoadContext, SharedLoadContext, UnloadHandle,
};
pub use permission::{Permission, PermissionManager};
pub use validation::{PluginValidator, ValidationResult, ValidationRule};
pub use version::{Version, VersionRange};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Invalid manifest {}: {reason}", path.display())]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("No manifest serializer handles {}", .0.display())]
    UnsupportedManifest(PathBuf),

    #[error("Invalid version '{0}'")]
    InvalidVersion(String),

    #[error("Invalid version range '{range}': {reason}")]
    InvalidVersionRange { range: String, reason: String },

    #[error("Circular dependency detected involving plugin '{0}'")]
    CircularDependency(String),

    #[error("Plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("Plugin '{plugin_id}' failed validation: {}", errors.join("; "))]
    ValidationFailed {
        plugin_id: String,
        errors: Vec<String>,
    },

    #[error("Failed to load plugin '{plugin_id}': {reason}")]
    LoadFailed { plugin_id: String, reason: String },

    #[error("Load context for {} has been unloaded", .0.display())]
    ContextUnloaded(PathBuf),

    #[error("Plugin '{plugin_id}' lacks permission {permission:?}")]
    PermissionDenied {
        plugin_id: String,
        permission: Permission,
    },

    #[error("Plugin '{plugin_id}' failed during {operation}: {reason}")]
    LifecycleFailed {
        plugin_id: String,
        operation: &'static str,
        reason: String,
    },

    #[error("Plugin '{plugin_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        plugin_id: String,
        from: LifecyclePhase,
        to: LifecyclePhase,
    },

    #[error("Plugin '{plugin_id}' cannot {operation} while {phase}")]
    InvalidState {
        plugin_id: String,
        phase: String,
        operation: &'static str,
    },

    #[error("Plugin '{plugin_id}' requires '{dependency}', which is not running")]
    DependencyNotRunning {
        plugin_id: String,
        dependency: String,
    },

    #[error(transparent)]
    Core(#[from] addinhost_core::Error),

    #[error("Plugin IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PluginError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E500",
            Self::ManifestInvalid { .. } => "E501",
            Self::UnsupportedManifest(_) => "E502",
            Self::InvalidVersion(_) => "E503",
            Self::InvalidVersionRange { .. } => "E504",
            Self::CircularDependency(_) => "E505",
            Self::DuplicatePlugin(_) => "E506",
            Self::ValidationFailed { .. } => "E507",
            Self::LoadFailed { .. } => "E508",
            Self::ContextUnloaded(_) => "E509",
            Self::PermissionDenied { .. } => "E510",
            Self::LifecycleFailed { .. } => "E511",
            Self::InvalidTransition { .. } => "E512",
            Self::InvalidState { .. } => "E513",
            Self::DependencyNotRunning { .. } => "E514",
            Self::Core(inner) => inner.code(),
            Self::IoError(_) => "E599",
        }
    }

    /// Get a helpful suggestion for resolving this error
    pub fn suggestion(&self) -> Option<String> {
        let hint = match self {
            Self::NotFound(_) => Some("Run `addinhost discover <dir>` to list known plugins"),
            Self::ManifestInvalid { .. } => {
                Some("Check the manifest against the Addin document layout")
            }
            Self::UnsupportedManifest(_) => {
                Some("Manifests must end in .addin, .addin.json, .addin.yaml or .addin.xml")
            }
            Self::InvalidVersion(_) => Some("Versions use major.minor.patch[.build]"),
            Self::InvalidVersionRange { .. } => {
                Some("Use an exact version, '1.0+', or bracket notation such as '[1.0,2.0)'")
            }
            Self::CircularDependency(_) => {
                Some("Remove one of the dependencies forming the cycle")
            }
            Self::PermissionDenied { .. } => {
                Some("Add the permission to plugins.allowed_permissions in config.toml")
            }
            Self::DependencyNotRunning { .. } => {
                Some("Check the dependency's own load errors first")
            }
            Self::Core(inner) => return inner.suggestion(),
            _ => None,
        };
        hint.map(str::to_string)
    }
}

pub type PluginResult<T> = Result<T, PluginError>;
