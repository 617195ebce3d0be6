use super::{AddinManifest, ManifestDocument, ManifestSerializer, has_extension};
use std::path::Path;

/// `.yaml` / `.yml` manifests
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlManifestSerializer;

impl ManifestSerializer for YamlManifestSerializer {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn can_handle(&self, path: &Path) -> bool {
        has_extension(path, &["yaml", "yml"])
    }

    fn deserialize(&self, text: &str) -> anyhow::Result<AddinManifest> {
        let document: ManifestDocument = serde_yaml::from_str(text)?;
        Ok(document.addin)
    }

    fn serialize(&self, manifest: &AddinManifest) -> anyhow::Result<String> {
        let document = ManifestDocument {
            addin: manifest.clone(),
        };
        Ok(serde_yaml::to_string(&document)?)
    }
}
