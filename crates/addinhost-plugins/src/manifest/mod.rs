//! Plugin manifest model and format serializers
//!
//! Every format maps onto the same document:
//!
//! ```text
//! Addin:
//!   Id, Name, Version, Description, Author
//!   Runtime: { Assembly, TypeName }
//!   IconPath
//!   Dependencies: [ { AddinId, Version, Optional } ]
//!   Permissions: { Required: [ ... ] }
//!   Properties: { key: value }
//! ```

mod json;
mod xml;
mod yaml;

pub use json::JsonManifestSerializer;
pub use xml::XmlManifestSerializer;
pub use yaml::YamlManifestSerializer;

use crate::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Manifests larger than this are rejected before parsing
pub const MAX_MANIFEST_BYTES: u64 = 256 * 1024;

/// Top level manifest document: `{ "Addin": { ... } }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    #[serde(rename = "Addin")]
    pub addin: AddinManifest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AddinManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub runtime: RuntimeSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_path: Option<String>,
    pub dependencies: Vec<DependencyEntry>,
    pub permissions: PermissionsSection,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RuntimeSection {
    /// Path to the plugin library, relative to the manifest
    pub assembly: String,
    /// Entry point exported by the library
    pub type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DependencyEntry {
    pub addin_id: String,
    pub version: String,
    pub optional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PermissionsSection {
    pub required: Vec<String>,
}

impl AddinManifest {
    /// Structural checks shared by every format
    pub fn check(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Addin.Id cannot be empty".to_string());
        }
        if self.runtime.assembly.trim().is_empty() {
            return Err("Addin.Runtime.Assembly cannot be empty".to_string());
        }
        if let Some(dep) = self.dependencies.iter().find(|d| d.addin_id.trim().is_empty()) {
            return Err(format!(
                "Dependency with version '{}' has no AddinId",
                dep.version
            ));
        }
        Ok(())
    }
}

/// One manifest file format
pub trait ManifestSerializer: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, path: &Path) -> bool;

    fn deserialize(&self, text: &str) -> anyhow::Result<AddinManifest>;

    fn serialize(&self, manifest: &AddinManifest) -> anyhow::Result<String>;
}

pub(crate) fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// Ordered set of serializers; the first one whose `can_handle` matches is used
pub struct ManifestSerializers {
    serializers: Vec<Box<dyn ManifestSerializer>>,
}

impl Default for ManifestSerializers {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for ManifestSerializers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.serializers.iter().map(|s| s.name()))
            .finish()
    }
}

impl ManifestSerializers {
    pub fn empty() -> Self {
        Self {
            serializers: Vec::new(),
        }
    }

    /// JSON, YAML and XML, in that order
    pub fn standard() -> Self {
        let mut serializers = Self::empty();
        serializers.register(JsonManifestSerializer);
        serializers.register(YamlManifestSerializer);
        serializers.register(XmlManifestSerializer);
        serializers
    }

    pub fn register(&mut self, serializer: impl ManifestSerializer + 'static) {
        self.serializers.push(Box::new(serializer));
    }

    pub fn for_path(&self, path: &Path) -> Option<&dyn ManifestSerializer> {
        self.serializers
            .iter()
            .find(|s| s.can_handle(path))
            .map(|s| s.as_ref())
    }

    pub fn can_handle(&self, path: &Path) -> bool {
        self.for_path(path).is_some()
    }

    /// Parse `text` with the serializer selected for `path`
    pub fn parse(&self, path: &Path, text: &str) -> PluginResult<AddinManifest> {
        let serializer = self
            .for_path(path)
            .ok_or_else(|| PluginError::UnsupportedManifest(path.to_path_buf()))?;

        let manifest = serializer
            .deserialize(text)
            .map_err(|e| PluginError::ManifestInvalid {
                path: path.to_path_buf(),
                reason: format!("{} parse error: {e:#}", serializer.name()),
            })?;

        manifest.check().map_err(|reason| PluginError::ManifestInvalid {
            path: path.to_path_buf(),
            reason,
        })?;

        Ok(manifest)
    }

    /// Read and parse a manifest file with a size cap
    pub async fn load(&self, path: &Path) -> PluginResult<AddinManifest> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() > MAX_MANIFEST_BYTES {
            return Err(PluginError::ManifestInvalid {
                path: path.to_path_buf(),
                reason: format!(
                    "Manifest file too large: {} bytes (limit {MAX_MANIFEST_BYTES})",
                    metadata.len()
                ),
            });
        }

        let text = tokio::fs::read_to_string(path).await?;
        self.parse(path, &text)
    }

    pub fn serialize(&self, path: &Path, manifest: &AddinManifest) -> PluginResult<String> {
        let serializer = self
            .for_path(path)
            .ok_or_else(|| PluginError::UnsupportedManifest(path.to_path_buf()))?;
        serializer
            .serialize(manifest)
            .map_err(|e| PluginError::ManifestInvalid {
                path: path.to_path_buf(),
                reason: format!("{} write error: {e:#}", serializer.name()),
            })
    }
}

#[cfg(test)]
pub(crate) fn sample_manifest() -> AddinManifest {
    AddinManifest {
        id: "scope-viewer".to_string(),
        name: "Scope Viewer".to_string(),
        version: "1.2.0".to_string(),
        description: "Oscilloscope trace viewer".to_string(),
        author: "Lab Tools".to_string(),
        runtime: RuntimeSection {
            assembly: "bin/scope_viewer.so".to_string(),
            type_name: "scope_viewer::Plugin".to_string(),
        },
        icon_path: Some("icon.png".to_string()),
        dependencies: vec![
            DependencyEntry {
                addin_id: "trace-core".to_string(),
                version: "[1.0,2.0)".to_string(),
                optional: false,
            },
            DependencyEntry {
                addin_id: "exporter".to_string(),
                version: "1.0+".to_string(),
                optional: true,
            },
        ],
        permissions: PermissionsSection {
            required: vec!["FileSystem".to_string(), "Network".to_string()],
        },
        properties: BTreeMap::from([
            ("channel".to_string(), "A".to_string()),
            ("rate".to_string(), "100".to_string()),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_selection_by_extension() {
        let serializers = ManifestSerializers::standard();
        let name = |p: &str| serializers.for_path(&PathBuf::from(p)).map(|s| s.name());

        assert_eq!(name("a.addin.json"), Some("json"));
        assert_eq!(name("a.addin.yaml"), Some("yaml"));
        assert_eq!(name("a.addin.YML"), Some("yaml"));
        assert_eq!(name("a.addin"), Some("xml"));
        assert_eq!(name("a.addin.xml"), Some("xml"));
        assert_eq!(name("a.toml"), None);
    }

    #[test]
    fn test_parse_failure_is_not_retried() {
        let serializers = ManifestSerializers::standard();
        // Valid YAML, but the selected serializer is JSON
        let err = serializers
            .parse(Path::new("p.addin.json"), "Addin:\n  Id: p\n")
            .unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid { .. }));
        assert!(err.to_string().contains("json"));
    }

    #[test]
    fn test_structural_check() {
        let serializers = ManifestSerializers::standard();
        let err = serializers
            .parse(
                Path::new("p.addin.json"),
                r#"{"Addin": {"Id": "p", "Runtime": {"Assembly": ""}}}"#,
            )
            .unwrap_err();
        assert!(err.to_string().contains("Assembly"));
    }

    #[test]
    fn test_unsupported_extension() {
        let serializers = ManifestSerializers::standard();
        let err = serializers.parse(Path::new("p.ini"), "").unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedManifest(_)));
    }

    #[tokio::test]
    async fn test_load_rejects_oversized_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("big.addin.json");
        std::fs::write(&path, vec![b' '; (MAX_MANIFEST_BYTES + 1) as usize]).unwrap();

        let err = ManifestSerializers::standard().load(&path).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
