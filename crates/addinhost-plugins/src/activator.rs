//! Plugin trait and instance activation
//!
//! A native plugin exports a constructor named after its manifest
//! `TypeName`, with `::` and `.` replaced by `_`:
//!
//! ```ignore
//! #[unsafe(no_mangle)]
//! pub extern "C" fn scope_viewer_Plugin() -> *mut Box<dyn Plugin> {
//!     Box::into_raw(Box::new(Box::new(ScopeViewer::default())))
//! }
//! ```

use crate::load_context::{LoadedUnit, PluginLoadContext};
use crate::{PluginContext, PluginDescriptor, PluginError, PluginResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

/// Implemented by every plugin. Hooks are driven by the lifecycle manager;
/// only `initialize` is required.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn initialize(&self, context: PluginContext) -> anyhow::Result<()>;

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_enable(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disable(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Constructor exported by native plugins
pub type PluginEntryFn = unsafe extern "C" fn() -> *mut Box<dyn Plugin>;

/// A plugin instance that keeps the unit its code came from mapped.
///
/// Every clone holds the unit, so an instance handed out by the host can
/// never outlive the library behind its vtable. Field order matters: the
/// instance is dropped before the unit.
#[derive(Clone)]
pub struct PluginHandle {
    instance: Arc<dyn Plugin>,
    unit: Arc<LoadedUnit>,
}

impl PluginHandle {
    pub fn unit(&self) -> &Arc<LoadedUnit> {
        &self.unit
    }
}

impl Deref for PluginHandle {
    type Target = dyn Plugin;

    fn deref(&self) -> &Self::Target {
        &*self.instance
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("unit", &self.unit.name())
            .finish()
    }
}

/// A live plugin instance produced by an activator
#[derive(Debug)]
pub struct LoadedPlugin {
    handle: PluginHandle,
}

impl LoadedPlugin {
    pub fn new(instance: Arc<dyn Plugin>, unit: Arc<LoadedUnit>) -> Self {
        Self {
            handle: PluginHandle { instance, unit },
        }
    }

    pub fn instance(&self) -> &PluginHandle {
        &self.handle
    }

    pub fn unit(&self) -> &Arc<LoadedUnit> {
        &self.handle.unit
    }
}

/// Turns a validated descriptor into a running instance
pub trait PluginActivator: Send + Sync {
    fn activate(
        &self,
        descriptor: &PluginDescriptor,
        context: &PluginLoadContext,
    ) -> PluginResult<LoadedPlugin>;
}

/// Loads the assembly and calls its exported constructor
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeActivator;

impl NativeActivator {
    /// Exported symbol for a manifest `TypeName`
    pub fn entry_symbol(type_name: &str) -> String {
        type_name.replace("::", "_").replace('.', "_")
    }
}

impl PluginActivator for NativeActivator {
    fn activate(
        &self,
        descriptor: &PluginDescriptor,
        context: &PluginLoadContext,
    ) -> PluginResult<LoadedPlugin> {
        let load_failed = |reason: String| PluginError::LoadFailed {
            plugin_id: descriptor.id.clone(),
            reason,
        };

        if descriptor.type_name.trim().is_empty() {
            return Err(load_failed("manifest has no Runtime.TypeName".to_string()));
        }

        let unit = context.load_main()?;
        let symbol = Self::entry_symbol(&descriptor.type_name);

        let entry: PluginEntryFn = {
            // SAFETY: native plugins export `symbol` with the `PluginEntryFn` signature
            let exported = unsafe { unit.symbol::<PluginEntryFn>(&symbol)? };
            *exported
        };

        // SAFETY: the constructor takes no arguments; a panic must not cross
        // into the host
        let raw = panic::catch_unwind(AssertUnwindSafe(|| unsafe { entry() }))
            .map_err(|_| load_failed(format!("constructor '{symbol}' panicked")))?;
        if raw.is_null() {
            return Err(load_failed(format!("constructor '{symbol}' returned null")));
        }

        // SAFETY: the pointer comes from `Box::into_raw` in the plugin
        let boxed: Box<Box<dyn Plugin>> = unsafe { Box::from_raw(raw) };
        debug!(plugin_id = %descriptor.id, symbol = %symbol, "Native plugin activated");

        Ok(LoadedPlugin::new(Arc::from(*boxed), unit))
    }
}

type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Activates plugins compiled into the host, keyed by `TypeName`
#[derive(Clone, Default)]
pub struct StaticActivator {
    factories: HashMap<String, PluginFactory>,
}

impl std::fmt::Debug for StaticActivator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("StaticActivator")
            .field("type_names", &names)
            .finish()
    }
}

impl StaticActivator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
    }

    pub fn with<F>(mut self, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.register(type_name, factory);
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }
}

impl PluginActivator for StaticActivator {
    fn activate(
        &self,
        descriptor: &PluginDescriptor,
        context: &PluginLoadContext,
    ) -> PluginResult<LoadedPlugin> {
        let factory = self
            .factories
            .get(&descriptor.type_name)
            .ok_or_else(|| PluginError::LoadFailed {
                plugin_id: descriptor.id.clone(),
                reason: format!("no factory registered for '{}'", descriptor.type_name),
            })?;

        let unit = context.attach_in_process(&descriptor.type_name)?;
        Ok(LoadedPlugin::new(factory(), unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Version;
    use tempfile::TempDir;

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {
        async fn initialize(&self, _context: PluginContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn context(dir: &TempDir) -> (PluginDescriptor, PluginLoadContext) {
        let assembly = dir.path().join("noop.so");
        std::fs::write(&assembly, b"not a library").unwrap();
        let mut descriptor =
            PluginDescriptor::new("noop", Version::new(1, 0, 0)).with_type_name("noop::Plugin");
        descriptor.assembly_path = assembly.clone();
        let context = PluginLoadContext::new(&assembly, Arc::default()).unwrap();
        (descriptor, context)
    }

    #[test]
    fn test_entry_symbol_mapping() {
        assert_eq!(NativeActivator::entry_symbol("scope::Plugin"), "scope_Plugin");
        assert_eq!(NativeActivator::entry_symbol("Lab.Scope.Viewer"), "Lab_Scope_Viewer");
        assert_eq!(NativeActivator::entry_symbol("create"), "create");
    }

    #[test]
    fn test_native_activation_reports_load_failure() {
        let dir = TempDir::new().unwrap();
        let (descriptor, context) = context(&dir);
        let err = NativeActivator.activate(&descriptor, &context).unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { .. }));
    }

    #[test]
    fn test_static_activation_tracks_unit() {
        let dir = TempDir::new().unwrap();
        let (descriptor, context) = context(&dir);
        let activator = StaticActivator::new().with("noop::Plugin", || Arc::new(Noop));
        assert!(activator.contains("noop::Plugin"));

        let loaded = activator.activate(&descriptor, &context).unwrap();
        assert_eq!(loaded.unit().name(), "noop::Plugin");
        assert_eq!(context.loaded_units(), 1);

        let handle = context.unload();
        assert!(!handle.is_reclaimed());
        drop(loaded);
        assert!(handle.is_reclaimed());
    }

    #[test]
    fn test_instance_clone_keeps_unit_alive() {
        let dir = TempDir::new().unwrap();
        let (descriptor, context) = context(&dir);
        let activator = StaticActivator::new().with("noop::Plugin", || Arc::new(Noop));

        let loaded = activator.activate(&descriptor, &context).unwrap();
        let retained = loaded.instance().clone();
        let handle = context.unload();
        drop(loaded);

        assert!(!handle.is_reclaimed());
        assert_eq!(retained.unit().name(), "noop::Plugin");
        drop(retained);
        assert!(handle.is_reclaimed());
    }

    #[test]
    fn test_static_activation_unknown_type() {
        let dir = TempDir::new().unwrap();
        let (descriptor, context) = context(&dir);
        let err = StaticActivator::new()
            .activate(&descriptor, &context)
            .unwrap_err();
        assert!(err.to_string().contains("no factory"));
    }
}
