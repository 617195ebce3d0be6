//! Runtime view of a discovered plugin

use crate::lifecycle::LifecyclePhase;
use crate::manifest::{AddinManifest, DependencyEntry, PermissionsSection, RuntimeSection};
use crate::{Permission, PluginResult, Version, VersionRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Host-visible state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    #[default]
    Discovered,
    Loading,
    Loaded,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Failed,
    Unloading,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Unloading => "unloading",
        }
    }
}

impl FromStr for PluginState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discovered" => Ok(Self::Discovered),
            "loading" => Ok(Self::Loading),
            "loaded" => Ok(Self::Loaded),
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "unloading" => Ok(Self::Unloading),
            _ => Err(format!("Unknown plugin state: {s}")),
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Once an instance exists its lifecycle phase is authoritative; the host
/// state is derived from it.
impl From<LifecyclePhase> for PluginState {
    fn from(phase: LifecyclePhase) -> Self {
        match phase {
            LifecyclePhase::Created => Self::Loaded,
            LifecyclePhase::Initializing
            | LifecyclePhase::Initialized
            | LifecyclePhase::Starting => Self::Initializing,
            LifecyclePhase::Running => Self::Running,
            LifecyclePhase::Stopping => Self::Stopping,
            LifecyclePhase::Stopped => Self::Stopped,
            LifecyclePhase::Disposing | LifecyclePhase::Disposed => Self::Unloading,
            LifecyclePhase::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyInfo {
    pub plugin_id: String,
    pub version_range: VersionRange,
    pub is_optional: bool,
}

impl DependencyInfo {
    pub fn required(plugin_id: impl Into<String>, version_range: VersionRange) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version_range,
            is_optional: false,
        }
    }

    pub fn optional(plugin_id: impl Into<String>, version_range: VersionRange) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version_range,
            is_optional: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    /// `None` when the manifest version is missing or unparsable
    pub version: Option<Version>,
    pub description: String,
    pub author: String,
    pub assembly_path: PathBuf,
    pub type_name: String,
    pub dependencies: Vec<DependencyInfo>,
    pub properties: BTreeMap<String, String>,
    pub state: PluginState,
    pub loaded_time: Option<DateTime<Utc>>,
    pub icon_path: Option<PathBuf>,
    pub permissions: Permission,
    pub manifest_path: Option<PathBuf>,
}

impl PluginDescriptor {
    /// Minimal descriptor, mostly useful for in-process plugins and tests
    pub fn new(id: impl Into<String>, version: Version) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: Some(version),
            description: String::new(),
            author: String::new(),
            assembly_path: PathBuf::new(),
            type_name: String::new(),
            dependencies: Vec::new(),
            properties: BTreeMap::new(),
            state: PluginState::Discovered,
            loaded_time: None,
            icon_path: None,
            permissions: Permission::NONE,
            manifest_path: None,
        }
    }

    pub fn with_dependency(mut self, dependency: DependencyInfo) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    pub fn with_permissions(mut self, permissions: Permission) -> Self {
        self.permissions = permissions;
        self
    }

    /// Build a descriptor from a parsed manifest. Relative paths are resolved
    /// against `base_dir`; the assembly is not checked for existence here.
    pub fn from_manifest(
        manifest: &AddinManifest,
        base_dir: &Path,
        manifest_path: Option<PathBuf>,
    ) -> PluginResult<Self> {
        let dependencies = manifest
            .dependencies
            .iter()
            .map(|dep| {
                Ok(DependencyInfo {
                    plugin_id: dep.addin_id.trim().to_string(),
                    version_range: VersionRange::parse(&dep.version)?,
                    is_optional: dep.optional,
                })
            })
            .collect::<PluginResult<Vec<_>>>()?;

        let name = if manifest.name.trim().is_empty() {
            manifest.id.clone()
        } else {
            manifest.name.clone()
        };

        Ok(Self {
            id: manifest.id.trim().to_string(),
            name,
            version: manifest.version.parse().ok(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            assembly_path: base_dir.join(&manifest.runtime.assembly),
            type_name: manifest.runtime.type_name.clone(),
            dependencies,
            properties: manifest.properties.clone(),
            state: PluginState::Discovered,
            loaded_time: None,
            icon_path: manifest
                .icon_path
                .as_deref()
                .map(|icon| base_dir.join(icon)),
            permissions: Permission::parse_list(&manifest.permissions.required),
            manifest_path,
        })
    }

    /// Inverse of [`Self::from_manifest`]; paths are written as given
    pub fn to_manifest(&self) -> AddinManifest {
        AddinManifest {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.map(|v| v.to_string()).unwrap_or_default(),
            description: self.description.clone(),
            author: self.author.clone(),
            runtime: RuntimeSection {
                assembly: self.assembly_path.display().to_string(),
                type_name: self.type_name.clone(),
            },
            icon_path: self.icon_path.as_ref().map(|p| p.display().to_string()),
            dependencies: self
                .dependencies
                .iter()
                .map(|dep| DependencyEntry {
                    addin_id: dep.plugin_id.clone(),
                    version: dep.version_range.to_string(),
                    optional: dep.is_optional,
                })
                .collect(),
            permissions: PermissionsSection {
                required: self
                    .permissions
                    .names()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            },
            properties: self.properties.clone(),
        }
    }

    /// Directory holding the plugin's assembly
    pub fn plugin_dir(&self) -> Option<&Path> {
        self.assembly_path.parent()
    }

    pub fn version_label(&self) -> String {
        self.version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string())
    }

    pub fn required_dependencies(&self) -> impl Iterator<Item = &DependencyInfo> {
        self.dependencies.iter().filter(|dep| !dep.is_optional)
    }
}
