//! Per-plugin load contexts
//!
//! Each plugin assembly gets its own [`PluginLoadContext`]. Library names are
//! resolved against the plugin's private dependency manifest
//! (`<assembly stem>.deps.json`) and the plugin directory first, and only then
//! against the host-owned [`SharedLoadContext`].
//!
//! Units are shared as `Arc<LoadedUnit>`. Unloading a context drops the
//! context's own references and hands back weak ones in an [`UnloadHandle`];
//! the libraries are actually closed once every instance created from them is
//! gone.

use crate::{PluginError, PluginResult};
use dashmap::DashMap;
use libloading::Library;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

const RECLAIM_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A library (or in-process placeholder) owned by a load context
#[derive(Debug)]
pub struct LoadedUnit {
    name: String,
    path: PathBuf,
    library: Option<Library>,
}

impl LoadedUnit {
    fn open(name: &str, path: &Path) -> PluginResult<Self> {
        // SAFETY: running library initialisers is inherent to native plugins;
        // only validated assemblies and their declared dependencies get here.
        let library = unsafe { Library::new(path) }.map_err(|e| PluginError::LoadFailed {
            plugin_id: name.to_string(),
            reason: format!("{}: {e}", path.display()),
        })?;

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            library: Some(library),
        })
    }

    fn open_system(name: &str) -> PluginResult<Self> {
        let file_name = libloading::library_filename(name);
        // SAFETY: see `open`
        let library = unsafe { Library::new(&file_name) }.map_err(|e| PluginError::LoadFailed {
            plugin_id: name.to_string(),
            reason: format!("shared library '{name}' not found: {e}"),
        })?;

        Ok(Self {
            name: name.to_string(),
            path: PathBuf::from(file_name),
            library: Some(library),
        })
    }

    /// Unit for code linked into the host process
    pub(crate) fn in_process(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: PathBuf::new(),
            library: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }

    /// Look up an exported symbol.
    ///
    /// # Safety
    /// `T` must match the actual type of the exported symbol.
    pub unsafe fn symbol<T>(&self, symbol: &str) -> PluginResult<libloading::Symbol<'_, T>> {
        let library = self.library.as_ref().ok_or_else(|| PluginError::LoadFailed {
            plugin_id: self.name.clone(),
            reason: "in-process unit has no symbols".to_string(),
        })?;

        // SAFETY: forwarded to the caller
        unsafe { library.get(symbol.as_bytes()) }.map_err(|e| PluginError::LoadFailed {
            plugin_id: self.name.clone(),
            reason: format!("symbol '{symbol}' not found: {e}"),
        })
    }
}

/// Weak view of the units released by [`PluginLoadContext::unload`]
#[derive(Debug, Clone)]
pub struct UnloadHandle {
    assembly_path: PathBuf,
    units: Vec<Weak<LoadedUnit>>,
}

impl UnloadHandle {
    pub fn assembly_path(&self) -> &Path {
        &self.assembly_path
    }

    /// True once nothing holds any of the released units
    pub fn is_reclaimed(&self) -> bool {
        self.units.iter().all(|unit| unit.strong_count() == 0)
    }

    /// Poll until reclaimed or `timeout` passes; returns the final state
    pub async fn wait_for_reclaim(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_reclaimed() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(RECLAIM_POLL_INTERVAL).await;
        }
        true
    }
}

/// `<assembly stem>.deps.json`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PrivateDependencies {
    /// Managed libraries: name -> path relative to the plugin directory
    pub libraries: BTreeMap<String, String>,
    /// Native libraries: name -> path relative to the plugin directory
    pub native: BTreeMap<String, String>,
}

impl PrivateDependencies {
    pub fn manifest_path(assembly_path: &Path) -> Option<PathBuf> {
        let stem = assembly_path.file_stem()?.to_str()?;
        Some(assembly_path.with_file_name(format!("{stem}.deps.json")))
    }

    /// Missing manifest means no private dependencies
    pub fn load(assembly_path: &Path) -> PluginResult<Self> {
        let Some(path) = Self::manifest_path(assembly_path) else {
            return Ok(Self::default());
        };
        if !path.is_file() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| PluginError::ManifestInvalid {
            path,
            reason: format!("Invalid dependency manifest JSON: {e}"),
        })
    }
}

/// Process-wide cache of libraries shared between plugins
#[derive(Debug, Default)]
pub struct SharedLoadContext {
    units: DashMap<String, Arc<LoadedUnit>>,
}

impl SharedLoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadedUnit>> {
        self.units.get(name).map(|unit| Arc::clone(&unit))
    }

    /// Return the cached unit or open `name` from the system search path
    pub fn resolve(&self, name: &str) -> PluginResult<Arc<LoadedUnit>> {
        if let Some(unit) = self.get(name) {
            return Ok(unit);
        }
        let unit = Arc::new(LoadedUnit::open_system(name)?);
        let unit = self.units.entry(name.to_string()).or_insert(unit);
        Ok(Arc::clone(&unit))
    }

    /// Open a library from an explicit path and cache it under `name`
    pub fn preload(&self, name: &str, path: &Path) -> PluginResult<Arc<LoadedUnit>> {
        let unit = Arc::new(LoadedUnit::open(name, path)?);
        self.units.insert(name.to_string(), Arc::clone(&unit));
        Ok(unit)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[derive(Debug)]
pub struct PluginLoadContext {
    assembly_path: PathBuf,
    plugin_dir: PathBuf,
    dependencies: PrivateDependencies,
    shared: Arc<SharedLoadContext>,
    units: Mutex<Vec<Arc<LoadedUnit>>>,
    unloaded: AtomicBool,
}

impl PluginLoadContext {
    pub fn new(assembly_path: &Path, shared: Arc<SharedLoadContext>) -> PluginResult<Self> {
        let plugin_dir = assembly_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Ok(Self {
            assembly_path: assembly_path.to_path_buf(),
            plugin_dir,
            dependencies: PrivateDependencies::load(assembly_path)?,
            shared,
            units: Mutex::new(Vec::new()),
            unloaded: AtomicBool::new(false),
        })
    }

    pub fn assembly_path(&self) -> &Path {
        &self.assembly_path
    }

    pub fn dependencies(&self) -> &PrivateDependencies {
        &self.dependencies
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    pub fn loaded_units(&self) -> usize {
        self.units.lock().len()
    }

    /// Private managed library path for `name`, if the plugin ships one
    pub fn resolve_library(&self, name: &str) -> Option<PathBuf> {
        self.resolve_private(&self.dependencies.libraries, name)
    }

    /// Private native library path for `name`, if the plugin ships one
    pub fn resolve_native(&self, name: &str) -> Option<PathBuf> {
        self.resolve_private(&self.dependencies.native, name)
    }

    fn resolve_private(&self, declared: &BTreeMap<String, String>, name: &str) -> Option<PathBuf> {
        let declared_path = declared
            .get(name)
            .map(|relative| self.plugin_dir.join(relative));
        let conventional = self.plugin_dir.join(libloading::library_filename(name));

        declared_path
            .into_iter()
            .chain(std::iter::once(conventional))
            .find(|candidate| candidate.is_file())
    }

    fn ensure_loaded(&self) -> PluginResult<()> {
        if self.is_unloaded() {
            return Err(PluginError::ContextUnloaded(self.assembly_path.clone()));
        }
        Ok(())
    }

    fn track(&self, unit: LoadedUnit) -> Arc<LoadedUnit> {
        let unit = Arc::new(unit);
        self.units.lock().push(Arc::clone(&unit));
        unit
    }

    /// Open the plugin assembly itself
    pub fn load_main(&self) -> PluginResult<Arc<LoadedUnit>> {
        self.ensure_loaded()?;
        let name = self
            .assembly_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("plugin");
        let unit = LoadedUnit::open(name, &self.assembly_path)?;
        debug!(assembly = %self.assembly_path.display(), "Loaded plugin assembly");
        Ok(self.track(unit))
    }

    /// Open a dependency: private copies first, then the shared context
    pub fn load_dependency(&self, name: &str) -> PluginResult<Arc<LoadedUnit>> {
        self.ensure_loaded()?;

        if let Some(path) = self.resolve_library(name).or_else(|| self.resolve_native(name)) {
            debug!(dependency = name, path = %path.display(), "Loading private dependency");
            return Ok(self.track(LoadedUnit::open(name, &path)?));
        }

        debug!(dependency = name, "Falling back to shared load context");
        self.shared.resolve(name)
    }

    /// Placeholder unit for plugins compiled into the host
    pub fn attach_in_process(&self, name: &str) -> PluginResult<Arc<LoadedUnit>> {
        self.ensure_loaded()?;
        Ok(self.track(LoadedUnit::in_process(name)))
    }

    /// Release this context's units. Further loads fail.
    pub fn unload(&self) -> UnloadHandle {
        self.unloaded.store(true, Ordering::Release);
        let released: Vec<Arc<LoadedUnit>> = std::mem::take(&mut *self.units.lock());
        info!(
            assembly = %self.assembly_path.display(),
            units = released.len(),
            "Load context unloaded"
        );

        UnloadHandle {
            assembly_path: self.assembly_path.clone(),
            units: released.iter().map(Arc::downgrade).collect(),
        }
    }
}

/// One load context per canonical assembly path
#[derive(Debug, Default)]
pub struct LoadContextRegistry {
    contexts: DashMap<PathBuf, Arc<PluginLoadContext>>,
    shared: Arc<SharedLoadContext>,
}

impl LoadContextRegistry {
    pub fn new(shared: Arc<SharedLoadContext>) -> Self {
        Self {
            contexts: DashMap::new(),
            shared,
        }
    }

    pub fn shared(&self) -> &Arc<SharedLoadContext> {
        &self.shared
    }

    fn key(assembly_path: &Path) -> PathBuf {
        assembly_path
            .canonicalize()
            .unwrap_or_else(|_| assembly_path.to_path_buf())
    }

    /// Existing live context for the assembly, or a fresh one
    pub fn get_or_create(&self, assembly_path: &Path) -> PluginResult<Arc<PluginLoadContext>> {
        let key = Self::key(assembly_path);
        if let Some(existing) = self.contexts.get(&key) {
            if !existing.is_unloaded() {
                return Ok(Arc::clone(&existing));
            }
        }

        let context = Arc::new(PluginLoadContext::new(&key, Arc::clone(&self.shared))?);
        self.contexts.insert(key, Arc::clone(&context));
        Ok(context)
    }

    pub fn get(&self, assembly_path: &Path) -> Option<Arc<PluginLoadContext>> {
        self.contexts
            .get(&Self::key(assembly_path))
            .map(|context| Arc::clone(&context))
    }

    pub fn remove(&self, assembly_path: &Path) -> Option<Arc<PluginLoadContext>> {
        self.contexts
            .remove(&Self::key(assembly_path))
            .map(|(_, context)| context)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plugin_dir() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let assembly = dir.path().join("scope.so");
        std::fs::write(&assembly, b"not a real library").unwrap();
        (dir, assembly)
    }

    #[test]
    fn test_private_dependency_resolution() {
        let (dir, assembly) = plugin_dir();
        std::fs::create_dir_all(dir.path().join("deps")).unwrap();
        std::fs::write(dir.path().join("deps/libmath.so"), b"").unwrap();
        std::fs::write(dir.path().join("deps/fftw.so"), b"").unwrap();
        std::fs::write(
            dir.path().join("scope.deps.json"),
            r#"{"libraries": {"math": "deps/libmath.so"}, "native": {"fftw": "deps/fftw.so"}}"#,
        )
        .unwrap();

        let context = PluginLoadContext::new(&assembly, Arc::default()).unwrap();
        assert_eq!(
            context.resolve_library("math"),
            Some(dir.path().join("deps/libmath.so"))
        );
        assert_eq!(context.resolve_native("fftw"), Some(dir.path().join("deps/fftw.so")));
        assert_eq!(context.resolve_library("fftw"), None);
        assert_eq!(context.resolve_library("unknown"), None);
    }

    #[test]
    fn test_conventional_file_name_in_plugin_dir() {
        let (dir, assembly) = plugin_dir();
        let file_name = libloading::library_filename("helper");
        std::fs::write(dir.path().join(&file_name), b"").unwrap();

        let context = PluginLoadContext::new(&assembly, Arc::default()).unwrap();
        assert_eq!(context.resolve_library("helper"), Some(dir.path().join(file_name)));
    }

    #[test]
    fn test_invalid_deps_manifest() {
        let (dir, assembly) = plugin_dir();
        std::fs::write(dir.path().join("scope.deps.json"), "{").unwrap();
        let err = PluginLoadContext::new(&assembly, Arc::default()).unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid { .. }));
    }

    #[test]
    fn test_garbage_assembly_fails_to_load() {
        let (_dir, assembly) = plugin_dir();
        let context = PluginLoadContext::new(&assembly, Arc::default()).unwrap();
        assert!(matches!(
            context.load_main(),
            Err(PluginError::LoadFailed { .. })
        ));
        assert_eq!(context.loaded_units(), 0);
    }

    #[tokio::test]
    async fn test_unload_releases_units() {
        let (_dir, assembly) = plugin_dir();
        let context = PluginLoadContext::new(&assembly, Arc::default()).unwrap();

        let held = context.attach_in_process("scope").unwrap();
        assert!(!held.is_native());
        assert_eq!(context.loaded_units(), 1);

        let handle = context.unload();
        assert!(context.is_unloaded());
        assert_eq!(context.loaded_units(), 0);
        assert!(!handle.is_reclaimed());
        assert!(!handle.wait_for_reclaim(Duration::from_millis(30)).await);

        drop(held);
        assert!(handle.is_reclaimed());
        assert!(handle.wait_for_reclaim(Duration::from_millis(30)).await);

        assert!(matches!(
            context.attach_in_process("again"),
            Err(PluginError::ContextUnloaded(_))
        ));
    }

    #[test]
    fn test_registry_reuses_live_contexts() {
        let (_dir, assembly) = plugin_dir();
        let registry = LoadContextRegistry::default();

        let first = registry.get_or_create(&assembly).unwrap();
        let second = registry.get_or_create(&assembly).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        first.unload();
        let fresh = registry.get_or_create(&assembly).unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));

        assert!(registry.remove(&assembly).is_some());
        assert!(registry.get(&assembly).is_none());
        assert!(registry.is_empty());
    }
}
