//! Plugin discovery
//!
//! Walks a plugin root recursively and turns every manifest file into a
//! [`PluginDescriptor`]. A manifest is any file with the `.addin` extension
//! or whose stem ends in `.addin` (`foo.addin.json`, `foo.addin.yaml`, ...).
//! A bad manifest never aborts the walk; it is logged and reported.

use crate::manifest::ManifestSerializers;
use crate::{PluginDescriptor, PluginError, PluginResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub descriptors: Vec<PluginDescriptor>,
    pub failures: Vec<DiscoveryFailure>,
}

impl DiscoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PluginDiscovery {
    serializers: ManifestSerializers,
}

impl PluginDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serializers(serializers: ManifestSerializers) -> Self {
        Self { serializers }
    }

    pub fn serializers(&self) -> &ManifestSerializers {
        &self.serializers
    }

    pub fn is_manifest_file(path: &Path) -> bool {
        let has_addin_ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("addin"));
        let has_addin_stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem.to_ascii_lowercase().ends_with(".addin"));
        has_addin_ext || has_addin_stem
    }

    /// Discover every manifest under `root`. A missing root yields an empty report.
    pub async fn discover(&self, root: &Path) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            debug!(root = %root.display(), "Plugin root does not exist");
            return report;
        }

        let (manifests, walk_failures) = Self::collect_manifests(vec![root.to_path_buf()]).await;
        report.failures.extend(walk_failures);

        let mut seen_ids = HashSet::new();
        for path in manifests {
            match self.discover_file(&path).await {
                Ok(descriptor) if !seen_ids.insert(descriptor.id.clone()) => {
                    let err = PluginError::DuplicatePlugin(descriptor.id);
                    warn!(path = %path.display(), error = %err, "Skipping duplicate plugin");
                    report.failures.push(DiscoveryFailure {
                        path,
                        error: err.to_string(),
                    });
                }
                Ok(descriptor) => {
                    debug!(
                        plugin_id = %descriptor.id,
                        version = %descriptor.version_label(),
                        "Discovered plugin"
                    );
                    report.descriptors.push(descriptor);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid plugin manifest");
                    report.failures.push(DiscoveryFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            root = %root.display(),
            discovered = report.descriptors.len(),
            failed = report.failures.len(),
            "Plugin discovery finished"
        );
        report
    }

    /// Parse a single manifest and resolve its assembly, which must exist
    pub async fn discover_file(&self, path: &Path) -> PluginResult<PluginDescriptor> {
        let manifest_path = tokio::fs::canonicalize(path).await?;
        let manifest = self.serializers.load(&manifest_path).await?;

        let base_dir = manifest_path
            .parent()
            .ok_or_else(|| PluginError::ManifestInvalid {
                path: manifest_path.clone(),
                reason: "Manifest path missing parent".to_string(),
            })?
            .to_path_buf();

        let mut descriptor =
            PluginDescriptor::from_manifest(&manifest, &base_dir, Some(manifest_path.clone()))?;

        let assembly = tokio::fs::canonicalize(&descriptor.assembly_path)
            .await
            .map_err(|e| PluginError::ManifestInvalid {
                path: manifest_path.clone(),
                reason: format!(
                    "Assembly {} not found: {e}",
                    descriptor.assembly_path.display()
                ),
            })?;

        if !tokio::fs::metadata(&assembly).await?.is_file() {
            return Err(PluginError::ManifestInvalid {
                path: manifest_path,
                reason: format!("Assembly {} is not a file", assembly.display()),
            });
        }

        descriptor.assembly_path = assembly;
        Ok(descriptor)
    }

    /// Manifest files under the `pending` directories, sorted by path.
    /// A directory that cannot be read is reported and the walk moves on.
    async fn collect_manifests(
        mut pending: Vec<PathBuf>,
    ) -> (Vec<PathBuf>, Vec<DiscoveryFailure>) {
        let mut manifests = Vec::new();
        let mut failures = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Failed to read plugin directory");
                    failures.push(DiscoveryFailure {
                        path: dir,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "Failed to list plugin directory");
                        failures.push(DiscoveryFailure {
                            path: dir.clone(),
                            error: e.to_string(),
                        });
                        break;
                    }
                };
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(file_type) => file_type,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to stat discovery entry");
                        failures.push(DiscoveryFailure {
                            path,
                            error: e.to_string(),
                        });
                        continue;
                    }
                };

                if file_type.is_symlink() {
                    debug!(path = %path.display(), "Skipping symlink during discovery");
                } else if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() && Self::is_manifest_file(&path) {
                    manifests.push(path);
                }
            }
        }

        manifests.sort();
        (manifests, failures)
    }
}
