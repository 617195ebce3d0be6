use super::{AddinManifest, ManifestDocument, ManifestSerializer, has_extension};
use std::path::Path;

/// `.json` manifests
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonManifestSerializer;

impl ManifestSerializer for JsonManifestSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn can_handle(&self, path: &Path) -> bool {
        has_extension(path, &["json"])
    }

    fn deserialize(&self, text: &str) -> anyhow::Result<AddinManifest> {
        let document: ManifestDocument = serde_json::from_str(text)?;
        Ok(document.addin)
    }

    fn serialize(&self, manifest: &AddinManifest) -> anyhow::Result<String> {
        let document = ManifestDocument {
            addin: manifest.clone(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::sample_manifest;

    #[test]
    fn test_json_document() {
        let text = r#"{
            "Addin": {
                "Id": "trace-core",
                "Name": "Trace Core",
                "Version": "1.4",
                "Runtime": { "Assembly": "trace_core.so", "TypeName": "trace_core::Plugin" },
                "Dependencies": [ { "AddinId": "math", "Version": "2.0+", "Optional": true } ],
                "Permissions": { "Required": [ "Database" ] },
                "Properties": { "buffer": "4096" }
            }
        }"#;

        let manifest = JsonManifestSerializer.deserialize(text).unwrap();
        assert_eq!(manifest.id, "trace-core");
        assert_eq!(manifest.runtime.type_name, "trace_core::Plugin");
        assert_eq!(manifest.dependencies[0].addin_id, "math");
        assert!(manifest.dependencies[0].optional);
        assert_eq!(manifest.permissions.required, vec!["Database"]);
        assert_eq!(manifest.properties["buffer"], "4096");
        assert_eq!(manifest.icon_path, None);
    }

    #[test]
    fn test_json_written_form_reads_back() {
        let manifest = sample_manifest();
        let text = JsonManifestSerializer.serialize(&manifest).unwrap();
        assert!(text.contains("\"Addin\""));
        assert_eq!(JsonManifestSerializer.deserialize(&text).unwrap(), manifest);
    }
}
