//! XML manifests use element form throughout; collections are wrapped:
//! `<Dependencies><Dependency>..</Dependency></Dependencies>`,
//! `<Permissions><Required>..</Required></Permissions>` and
//! `<Properties><Property><Key/><Value/></Property></Properties>`.

use super::{
    AddinManifest, DependencyEntry, ManifestSerializer, PermissionsSection, RuntimeSection,
    has_extension,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// `.addin` / `.xml` manifests
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlManifestSerializer;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct XmlAddin {
    id: String,
    name: String,
    version: String,
    description: String,
    author: String,
    runtime: RuntimeSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon_path: Option<String>,
    dependencies: XmlDependencies,
    permissions: PermissionsSection,
    properties: XmlProperties,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlDependencies {
    #[serde(rename = "Dependency", default)]
    items: Vec<DependencyEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlProperties {
    #[serde(rename = "Property", default)]
    items: Vec<XmlProperty>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct XmlProperty {
    key: String,
    value: String,
}

impl From<XmlAddin> for AddinManifest {
    fn from(xml: XmlAddin) -> Self {
        Self {
            id: xml.id,
            name: xml.name,
            version: xml.version,
            description: xml.description,
            author: xml.author,
            runtime: xml.runtime,
            icon_path: xml.icon_path.filter(|p| !p.trim().is_empty()),
            dependencies: xml.dependencies.items,
            permissions: xml.permissions,
            properties: xml
                .properties
                .items
                .into_iter()
                .map(|p| (p.key, p.value))
                .collect(),
        }
    }
}

impl From<&AddinManifest> for XmlAddin {
    fn from(manifest: &AddinManifest) -> Self {
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            runtime: manifest.runtime.clone(),
            icon_path: manifest.icon_path.clone(),
            dependencies: XmlDependencies {
                items: manifest.dependencies.clone(),
            },
            permissions: manifest.permissions.clone(),
            properties: XmlProperties {
                items: manifest
                    .properties
                    .iter()
                    .map(|(key, value)| XmlProperty {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            },
        }
    }
}

impl ManifestSerializer for XmlManifestSerializer {
    fn name(&self) -> &'static str {
        "xml"
    }

    fn can_handle(&self, path: &Path) -> bool {
        has_extension(path, &["addin", "xml"])
    }

    fn deserialize(&self, text: &str) -> anyhow::Result<AddinManifest> {
        let xml: XmlAddin = quick_xml::de::from_str(text)?;
        Ok(xml.into())
    }

    fn serialize(&self, manifest: &AddinManifest) -> anyhow::Result<String> {
        let mut buffer = String::new();
        let mut serializer = quick_xml::se::Serializer::with_root(&mut buffer, Some("Addin"))?;
        serializer.indent(' ', 2);
        XmlAddin::from(manifest).serialize(serializer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::sample_manifest;

    #[test]
    fn test_xml_element_form() {
        let text = r#"<?xml version="1.0" encoding="utf-8"?>
<Addin>
  <Id>trace-core</Id>
  <Name>Trace Core</Name>
  <Version>1.4.0</Version>
  <Runtime>
    <Assembly>trace_core.so</Assembly>
    <TypeName>trace_core::Plugin</TypeName>
  </Runtime>
  <Dependencies>
    <Dependency>
      <AddinId>math</AddinId>
      <Version>[1.0,2.0)</Version>
      <Optional>true</Optional>
    </Dependency>
    <Dependency>
      <AddinId>units</AddinId>
      <Version>1.0+</Version>
    </Dependency>
  </Dependencies>
  <Permissions>
    <Required>FileSystem</Required>
    <Required>Database</Required>
  </Permissions>
  <Properties>
    <Property><Key>buffer</Key><Value>4096</Value></Property>
  </Properties>
</Addin>"#;

        let manifest = XmlManifestSerializer.deserialize(text).unwrap();
        assert_eq!(manifest.id, "trace-core");
        assert_eq!(manifest.runtime.assembly, "trace_core.so");
        assert_eq!(manifest.dependencies.len(), 2);
        assert!(manifest.dependencies[0].optional);
        assert!(!manifest.dependencies[1].optional);
        assert_eq!(manifest.dependencies[1].version, "1.0+");
        assert_eq!(manifest.permissions.required, vec!["FileSystem", "Database"]);
        assert_eq!(manifest.properties["buffer"], "4096");
    }

    #[test]
    fn test_xml_minimal_document() {
        let text = "<Addin><Id>bare</Id><Runtime><Assembly>bare.so</Assembly></Runtime></Addin>";
        let manifest = XmlManifestSerializer.deserialize(text).unwrap();
        assert_eq!(manifest.id, "bare");
        assert!(manifest.dependencies.is_empty());
        assert!(manifest.permissions.required.is_empty());
    }

    #[test]
    fn test_xml_written_form_reads_back() {
        let manifest = sample_manifest();
        let text = XmlManifestSerializer.serialize(&manifest).unwrap();
        assert!(text.starts_with("<Addin>"));
        assert!(text.contains("<Dependency>"));
        assert!(text.contains("<Property>"));
        assert_eq!(XmlManifestSerializer.deserialize(&text).unwrap(), manifest);
    }
}
