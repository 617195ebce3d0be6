//! Plugin host
//!
//! Drives discovery → validation → dependency ordering → activation →
//! lifecycle start, and tears plugins down again (dependents first).

use crate::validation::SignatureRule;
use crate::{
    DependencyGraph, DiscoveryFailure, LifecycleManager, LifecyclePhase, LoadContextRegistry,
    LoadedPlugin, LoadedUnit, NativeActivator, Permission, PermissionManager, PluginActivator,
    PluginContext, PluginDescriptor, PluginDiscovery, PluginError, PluginHandle, PluginResult,
    PluginState, PluginValidator, SharedLoadContext, UnloadHandle,
};
use addinhost_core::bus::MessageBus;
use addinhost_core::config::{ConfigStore, HostConfig};
use addinhost_core::services::ServiceRegistry;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

const RELOAD_RECLAIM_TIMEOUT: Duration = Duration::from_secs(2);

/// Optional metrics sink, resolved from the host's service registry
pub trait PluginMetrics: Send + Sync {
    fn plugin_loaded(&self, plugin_id: &str, elapsed: Duration);

    fn plugin_failed(&self, plugin_id: &str, errors: &[String]);

    fn plugin_unloaded(&self, plugin_id: &str);
}

/// Caps concurrent plugin loads when registered in the service registry
#[derive(Debug, Clone)]
pub struct LoadConcurrency {
    semaphore: Arc<Semaphore>,
}

impl LoadConcurrency {
    pub fn new(max_concurrent_loads: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_loads.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> PluginResult<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| PluginError::Core(addinhost_core::Error::Other(e.to_string())))
    }
}

/// Outcome of [`PluginHost::discover_and_load`]
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Plugins now running, in load order
    pub loaded: Vec<String>,
    /// Plugins that failed validation or loading, with their errors
    pub failed: Vec<(String, Vec<String>)>,
    /// Manifest files that could not be turned into descriptors
    pub discovery_failures: Vec<DiscoveryFailure>,
}

impl LoadReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.discovery_failures.is_empty()
    }
}

struct PluginRecord {
    descriptor: PluginDescriptor,
    errors: Vec<String>,
    enabled: bool,
    loaded: Option<LoadedPlugin>,
}

impl PluginRecord {
    fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            errors: Vec::new(),
            enabled: false,
            loaded: None,
        }
    }
}

pub struct PluginHost {
    config: HostConfig,
    discovery: PluginDiscovery,
    signature: SignatureRule,
    allowed_permissions: Permission,
    activator: Arc<dyn PluginActivator>,
    contexts: LoadContextRegistry,
    graph: tokio::sync::RwLock<DependencyGraph>,
    records: RwLock<IndexMap<String, PluginRecord>>,
    bus: Arc<MessageBus>,
    permissions: Arc<PermissionManager>,
    lifecycle: Arc<LifecycleManager>,
    services: Arc<ServiceRegistry>,
    config_store: Arc<ConfigStore>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins", &self.records.read().keys().collect::<Vec<_>>())
            .field("allowed_permissions", &self.allowed_permissions)
            .finish()
    }
}

impl PluginHost {
    /// Host that activates native plugin libraries
    pub fn new(config: HostConfig) -> PluginResult<Self> {
        Self::with_activator(config, Arc::new(NativeActivator))
    }

    pub fn with_activator(
        config: HostConfig,
        activator: Arc<dyn PluginActivator>,
    ) -> PluginResult<Self> {
        let signature = SignatureRule::from_config(&config.plugins)?;
        let allowed_permissions = Permission::parse_list(&config.plugins.allowed_permissions);

        let bus = Arc::new(MessageBus::with_pool_capacity(config.bus.pool_capacity));
        let config_store = Arc::new(ConfigStore::new());
        let services = Arc::new(ServiceRegistry::new());
        services.register_singleton(Arc::clone(&bus));
        services.register_singleton(Arc::clone(&config_store));

        Ok(Self {
            lifecycle: Arc::new(LifecycleManager::new(config.lifecycle.operation_timeout())),
            config,
            discovery: PluginDiscovery::new(),
            signature,
            allowed_permissions,
            activator,
            contexts: LoadContextRegistry::new(Arc::new(SharedLoadContext::new())),
            graph: tokio::sync::RwLock::new(DependencyGraph::new()),
            records: RwLock::new(IndexMap::new()),
            bus,
            permissions: Arc::new(PermissionManager::new()),
            services,
            config_store,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.permissions
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config_store
    }

    pub fn discovery(&self) -> &PluginDiscovery {
        &self.discovery
    }

    /// Discover, validate, order and start every plugin under `root`.
    ///
    /// Per-plugin problems end up in the report; only a dependency cycle among
    /// the validated plugins fails the whole batch.
    pub async fn discover_and_load(&self, root: &Path) -> PluginResult<LoadReport> {
        let discovered = self.discovery.discover(root).await;
        let mut report = LoadReport {
            discovery_failures: discovered.failures,
            ..LoadReport::default()
        };

        let mut batch = Vec::new();
        for descriptor in discovered.descriptors {
            if self.is_loaded(&descriptor.id) {
                let error = PluginError::DuplicatePlugin(descriptor.id.clone()).to_string();
                warn!(plugin_id = %descriptor.id, "Plugin already loaded, skipping");
                report.failed.push((descriptor.id, vec![error]));
            } else {
                batch.push(descriptor);
            }
        }

        let available: Vec<PluginDescriptor> = batch
            .iter()
            .cloned()
            .chain(self.loaded_descriptors())
            .collect();
        let validator = self.validator(available);

        let mut valid = Vec::new();
        for descriptor in batch {
            let result = validator.validate(&descriptor).await;
            if result.is_valid {
                valid.push(descriptor);
            } else {
                warn!(plugin_id = %descriptor.id, errors = ?result.errors, "Plugin failed validation");
                report.failed.push((descriptor.id.clone(), result.errors.clone()));
                self.record_failure(descriptor, result.errors);
            }
        }

        let batch_ids: HashSet<String> = valid.iter().map(|d| d.id.clone()).collect();
        let order = {
            let mut graph = self.graph.write().await;
            for descriptor in &valid {
                graph.add_plugin(descriptor.clone());
            }
            match graph.topological_sort() {
                Ok(order) => order,
                Err(e) => {
                    for id in &batch_ids {
                        graph.remove_plugin(id);
                    }
                    return Err(e.into());
                }
            }
        };

        {
            let mut records = self.records.write();
            for descriptor in valid {
                records.insert(descriptor.id.clone(), PluginRecord::new(descriptor));
            }
        }

        for id in order.into_iter().filter(|id| batch_ids.contains(id)) {
            match self.load_one(&id).await {
                Ok(()) => report.loaded.push(id),
                Err(_) => {
                    let errors = self.errors(&id);
                    report.failed.push((id, errors));
                }
            }
        }

        info!(
            root = %root.display(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Plugin load finished"
        );
        Ok(report)
    }

    /// Load a single plugin from its manifest file
    pub async fn load_plugin_from_path(&self, manifest: &Path) -> PluginResult<PluginDescriptor> {
        let descriptor = self.discovery.discover_file(manifest).await?;
        let id = descriptor.id.clone();
        if self.is_loaded(&id) {
            return Err(PluginError::DuplicatePlugin(id));
        }

        let result = self
            .validator(self.loaded_descriptors())
            .validate(&descriptor)
            .await;
        if !result.is_valid {
            self.record_failure(descriptor, result.errors.clone());
            return Err(PluginError::ValidationFailed {
                plugin_id: id,
                errors: result.errors,
            });
        }

        {
            let mut graph = self.graph.write().await;
            graph.add_plugin(descriptor.clone());
            if let Err(e) = graph.topological_sort() {
                graph.remove_plugin(&id);
                drop(graph);
                self.record_failure(descriptor, vec![e.to_string()]);
                return Err(e.into());
            }
        }

        self.records
            .write()
            .insert(id.clone(), PluginRecord::new(descriptor));
        self.load_one(&id).await?;

        self.descriptor(&id)
            .ok_or_else(|| PluginError::NotFound(id))
    }

    /// Unload a plugin and, before it, everything that depends on it
    pub async fn unload_plugin(&self, id: &str) -> PluginResult<Vec<UnloadHandle>> {
        if !self.records.read().contains_key(id) {
            return Err(PluginError::NotFound(id.to_string()));
        }

        let mut handles = Vec::new();
        for target in self.unload_order(id).await {
            if let Some(handle) = self.unload_single(&target).await {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Unload and load again from the manifest; dependents are brought back too
    pub async fn reload_plugin(&self, id: &str) -> PluginResult<()> {
        if !self.records.read().contains_key(id) {
            return Err(PluginError::NotFound(id.to_string()));
        }

        let order = self.unload_order(id).await;
        let manifests: Vec<(String, Option<PathBuf>)> = order
            .iter()
            .map(|target| {
                let manifest = self.descriptor(target).and_then(|d| d.manifest_path);
                (target.clone(), manifest)
            })
            .collect();

        let own_manifest = manifests
            .iter()
            .find(|(target, _)| target == id)
            .and_then(|(_, manifest)| manifest.clone())
            .ok_or_else(|| PluginError::LoadFailed {
                plugin_id: id.to_string(),
                reason: "no manifest path recorded, cannot reload".to_string(),
            })?;

        for handle in self.unload_plugin(id).await? {
            if !handle.wait_for_reclaim(RELOAD_RECLAIM_TIMEOUT).await {
                warn!(
                    plugin_id = id,
                    assembly = %handle.assembly_path().display(),
                    "Unloaded assembly is still referenced"
                );
            }
        }

        self.load_plugin_from_path(&own_manifest).await?;

        for (dependent, manifest) in manifests.into_iter().rev() {
            if dependent == id {
                continue;
            }
            let Some(manifest) = manifest else {
                warn!(plugin_id = %dependent, "Dependent has no manifest path, not reloaded");
                continue;
            };
            if let Err(e) = self.load_plugin_from_path(&manifest).await {
                warn!(plugin_id = %dependent, error = %e, "Failed to reload dependent");
            }
        }

        info!(plugin_id = id, "Plugin reloaded");
        Ok(())
    }

    pub async fn enable_plugin(&self, id: &str) -> PluginResult<()> {
        let instance = self.instance(id)?;
        self.lifecycle.enable(id, &*instance).await?;
        self.set_enabled(id, true);
        Ok(())
    }

    pub async fn disable_plugin(&self, id: &str) -> PluginResult<()> {
        let instance = self.instance(id)?;
        self.lifecycle.disable(id, &*instance).await?;
        self.set_enabled(id, false);
        Ok(())
    }

    /// Start a plugin. Stopped or failed plugins are reloaded, since phases
    /// never move backwards.
    pub async fn start_plugin(&self, id: &str) -> PluginResult<()> {
        let known = self.records.read().contains_key(id);
        match self.lifecycle.phase(id) {
            Some(LifecyclePhase::Running) => Ok(()),
            Some(LifecyclePhase::Initialized) => {
                let instance = self.instance(id)?;
                self.lifecycle.start(id, &*instance).await
            }
            Some(LifecyclePhase::Stopped | LifecyclePhase::Failed) => self.reload_plugin(id).await,
            Some(phase) => Err(PluginError::InvalidState {
                plugin_id: id.to_string(),
                phase: phase.to_string(),
                operation: "start",
            }),
            None if known => self.reload_plugin(id).await,
            None => Err(PluginError::NotFound(id.to_string())),
        }
    }

    pub async fn stop_plugin(&self, id: &str) -> PluginResult<()> {
        let phase = self
            .lifecycle
            .require_phase(id, "stop", |phase| {
                matches!(phase, LifecyclePhase::Running | LifecyclePhase::Stopped)
            })?;
        if phase == LifecyclePhase::Stopped {
            return Ok(());
        }
        let instance = self.instance(id)?;
        self.lifecycle.stop(id, &*instance).await
    }

    /// Unload every plugin, dependents first
    pub async fn shutdown(&self) -> Vec<UnloadHandle> {
        let mut order: Vec<String> = {
            let graph = self.graph.read().await;
            graph
                .topological_sort()
                .unwrap_or_else(|_| graph.plugin_ids())
        };
        order.reverse();
        for id in self.records.read().keys() {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }

        let mut handles = Vec::new();
        for id in order {
            if let Some(handle) = self.unload_single(&id).await {
                handles.push(handle);
            }
        }
        info!(unloaded = handles.len(), "Plugin host shut down");
        handles
    }

    /// Ids of plugins with a live instance, in load order
    pub fn loaded_plugins(&self) -> Vec<String> {
        self.records
            .read()
            .iter()
            .filter(|(_, record)| record.loaded.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every known plugin, including failed ones
    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.records
            .read()
            .values()
            .map(|record| self.snapshot(record))
            .collect()
    }

    pub fn descriptor(&self, id: &str) -> Option<PluginDescriptor> {
        self.records.read().get(id).map(|record| self.snapshot(record))
    }

    pub fn errors(&self, id: &str) -> Vec<String> {
        self.records
            .read()
            .get(id)
            .map(|record| record.errors.clone())
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.records
            .read()
            .get(id)
            .is_some_and(|record| record.enabled)
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.records
            .read()
            .get(id)
            .is_some_and(|record| record.loaded.is_some())
    }

    /// Descriptor with its state derived from the lifecycle phase when one exists
    fn snapshot(&self, record: &PluginRecord) -> PluginDescriptor {
        let mut descriptor = record.descriptor.clone();
        if let Some(phase) = self.lifecycle.phase(&descriptor.id) {
            descriptor.state = PluginState::from(phase);
        }
        descriptor
    }

    fn validator(&self, available: Vec<PluginDescriptor>) -> PluginValidator {
        PluginValidator::standard(available, self.signature.clone())
    }

    fn loaded_descriptors(&self) -> Vec<PluginDescriptor> {
        self.records
            .read()
            .values()
            .filter(|record| record.loaded.is_some())
            .map(|record| record.descriptor.clone())
            .collect()
    }

    fn instance(&self, id: &str) -> PluginResult<PluginHandle> {
        self.records
            .read()
            .get(id)
            .and_then(|record| record.loaded.as_ref())
            .map(|loaded| loaded.instance().clone())
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    fn set_enabled(&self, id: &str, enabled: bool) {
        if let Some(record) = self.records.write().get_mut(id) {
            record.enabled = enabled;
        }
    }

    fn set_state(&self, id: &str, state: PluginState) {
        if let Some(record) = self.records.write().get_mut(id) {
            record.descriptor.state = state;
        }
    }

    fn metrics(&self) -> Option<Arc<dyn PluginMetrics>> {
        self.services.try_resolve::<dyn PluginMetrics>()
    }

    fn record_failure(&self, mut descriptor: PluginDescriptor, errors: Vec<String>) {
        if let Some(metrics) = self.metrics() {
            metrics.plugin_failed(&descriptor.id, &errors);
        }
        descriptor.state = PluginState::Failed;
        let mut record = PluginRecord::new(descriptor);
        record.errors = errors;
        self.records
            .write()
            .insert(record.descriptor.id.clone(), record);
    }

    fn grant_permissions(&self, descriptor: &PluginDescriptor) {
        let requested = descriptor.permissions;
        let granted = requested & self.allowed_permissions;
        let denied = requested - self.allowed_permissions;

        self.permissions.grant(&descriptor.id, granted);
        if !denied.is_empty() {
            warn!(
                plugin_id = %descriptor.id,
                denied = ?denied.names(),
                "Requested permissions denied by host policy"
            );
        }
    }

    fn plugin_context(&self, id: &str, unit: &Arc<LoadedUnit>) -> PluginContext {
        PluginContext::new(
            id,
            Arc::clone(unit),
            Arc::clone(&self.bus),
            Arc::clone(&self.permissions),
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.config_store),
            Arc::clone(&self.services),
            self.config.bus.request_timeout(),
        )
    }

    async fn load_one(&self, id: &str) -> PluginResult<()> {
        let _permit = match self.services.try_resolve::<LoadConcurrency>() {
            Some(concurrency) => Some(concurrency.acquire().await?),
            None => None,
        };

        let descriptor = self
            .records
            .read()
            .get(id)
            .map(|record| record.descriptor.clone())
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        for dependency in descriptor.required_dependencies() {
            if self.lifecycle.phase(&dependency.plugin_id) != Some(LifecyclePhase::Running) {
                let err = PluginError::DependencyNotRunning {
                    plugin_id: id.to_string(),
                    dependency: dependency.plugin_id.clone(),
                };
                return self.abort_load(&descriptor, err).await;
            }
        }

        self.set_state(id, PluginState::Loading);
        let started = Instant::now();

        match self.activate_and_start(&descriptor).await {
            Ok(loaded) => {
                if let Some(record) = self.records.write().get_mut(id) {
                    record.loaded = Some(loaded);
                    record.enabled = true;
                    record.errors.clear();
                    record.descriptor.state = PluginState::Running;
                    record.descriptor.loaded_time = Some(Utc::now());
                }
                if let Some(metrics) = self.metrics() {
                    metrics.plugin_loaded(id, started.elapsed());
                }
                info!(
                    plugin_id = id,
                    version = %descriptor.version_label(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Plugin loaded"
                );
                Ok(())
            }
            Err(e) => self.abort_load(&descriptor, e).await,
        }
    }

    async fn activate_and_start(&self, descriptor: &PluginDescriptor) -> PluginResult<LoadedPlugin> {
        let id = descriptor.id.as_str();
        let context = self.contexts.get_or_create(&descriptor.assembly_path)?;
        let loaded = self.activator.activate(descriptor, &context)?;

        self.lifecycle.register(id)?;
        self.grant_permissions(descriptor);

        self.lifecycle
            .initialize(id, &**loaded.instance(), self.plugin_context(id, loaded.unit()))
            .await?;
        self.lifecycle.start(id, &**loaded.instance()).await?;
        Ok(loaded)
    }

    /// Undo a partial load and keep the plugin around as failed
    async fn abort_load(&self, descriptor: &PluginDescriptor, err: PluginError) -> PluginResult<()> {
        let id = descriptor.id.as_str();
        warn!(plugin_id = id, error = %err, "Plugin failed to load");

        self.bus.unsubscribe_owner(id);
        self.permissions.clear(id);
        self.lifecycle.remove(id);
        if let Some(context) = self.contexts.remove(&descriptor.assembly_path) {
            context.unload();
        }
        self.graph.write().await.remove_plugin(id);

        let errors = {
            let mut records = self.records.write();
            let record = records
                .entry(id.to_string())
                .or_insert_with(|| PluginRecord::new(descriptor.clone()));
            record.loaded = None;
            record.enabled = false;
            record.descriptor.state = PluginState::Failed;
            record.errors.push(err.to_string());
            record.errors.clone()
        };
        if let Some(metrics) = self.metrics() {
            metrics.plugin_failed(id, &errors);
        }

        Err(err)
    }

    /// Dependents of `id` (furthest first) followed by `id` itself
    async fn unload_order(&self, id: &str) -> Vec<String> {
        let graph = self.graph.read().await;
        let dependents = graph.get_all_dependents(id);
        let affected: HashSet<&str> = dependents
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(id))
            .collect();

        let mut order: Vec<String> = match graph.topological_sort() {
            Ok(sorted) => sorted
                .into_iter()
                .rev()
                .filter(|candidate| affected.contains(candidate.as_str()))
                .collect(),
            Err(_) => dependents.iter().rev().cloned().collect(),
        };
        if !order.iter().any(|candidate| candidate == id) {
            order.push(id.to_string());
        }
        order
    }

    async fn unload_single(&self, id: &str) -> Option<UnloadHandle> {
        let (loaded, assembly) = {
            let mut records = self.records.write();
            let record = records.get_mut(id)?;
            record.descriptor.state = PluginState::Unloading;
            (record.loaded.take(), record.descriptor.assembly_path.clone())
        };

        if let Some(loaded) = &loaded {
            let instance = loaded.instance();
            if self.lifecycle.phase(id) == Some(LifecyclePhase::Running) {
                if let Err(e) = self.lifecycle.stop(id, &**instance).await {
                    warn!(plugin_id = id, error = %e, "Stop failed during unload");
                }
            }
            if self.lifecycle.phase(id).is_some_and(|phase| !phase.is_terminal()) {
                if let Err(e) = self.lifecycle.dispose(id, &**instance).await {
                    warn!(plugin_id = id, error = %e, "Dispose failed during unload");
                }
            }
        }

        let subscriptions = self.bus.unsubscribe_owner(id);
        self.permissions.clear(id);
        drop(loaded);

        let handle = self
            .contexts
            .remove(&assembly)
            .map(|context| context.unload());

        self.graph.write().await.remove_plugin(id);
        self.records.write().shift_remove(id);
        self.lifecycle.remove(id);

        if let Some(metrics) = self.metrics() {
            metrics.plugin_unloaded(id);
        }
        debug!(plugin_id = id, subscriptions, "Plugin resources released");
        info!(plugin_id = id, "Plugin unloaded");
        handle
    }
}
