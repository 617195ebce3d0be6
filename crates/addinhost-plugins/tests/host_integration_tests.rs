//! End-to-end host tests over on-disk plugin fixtures

use addinhost_core::config::HostConfig;
use addinhost_plugins::{
    AdminCommand, LifecyclePhase, LoadConcurrency, Permission, Plugin, PluginAdministrator,
    PluginContext, PluginError, PluginHost, PluginMetrics, PluginState, StaticActivator,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

struct Recorder {
    id: String,
    journal: Journal,
    fail_initialize: bool,
}

#[async_trait]
impl Plugin for Recorder {
    async fn initialize(&self, _context: PluginContext) -> anyhow::Result<()> {
        self.journal.push(format!("init {}", self.id));
        if self.fail_initialize {
            anyhow::bail!("{} refuses to initialize", self.id);
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.journal.push(format!("start {}", self.id));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.journal.push(format!("stop {}", self.id));
        Ok(())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.journal.push(format!("dispose {}", self.id));
        Ok(())
    }

    async fn on_enable(&self) -> anyhow::Result<()> {
        self.journal.push(format!("enable {}", self.id));
        Ok(())
    }

    async fn on_disable(&self) -> anyhow::Result<()> {
        self.journal.push(format!("disable {}", self.id));
        Ok(())
    }
}

struct Echo;

#[async_trait]
impl Plugin for Echo {
    async fn initialize(&self, context: PluginContext) -> anyhow::Result<()> {
        context.serve("echo.upper", |text: String| async move {
            Ok(text.to_uppercase())
        })?;
        Ok(())
    }
}

#[derive(Default)]
struct CountingMetrics {
    loaded: AtomicUsize,
    failed: AtomicUsize,
    unloaded: AtomicUsize,
}

impl PluginMetrics for CountingMetrics {
    fn plugin_loaded(&self, _plugin_id: &str, _elapsed: Duration) {
        self.loaded.fetch_add(1, Ordering::SeqCst);
    }

    fn plugin_failed(&self, _plugin_id: &str, _errors: &[String]) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn plugin_unloaded(&self, _plugin_id: &str) {
        self.unloaded.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    root: TempDir,
    journal: Journal,
    activator: StaticActivator,
}

impl Fixture {
    fn new() -> Self {
        Self {
            root: TempDir::new().expect("temp dir"),
            journal: Journal::default(),
            activator: StaticActivator::new(),
        }
    }

    /// Write `<root>/<id>/<id>.addin.json` plus a placeholder assembly
    fn plugin(&mut self, id: &str, dependencies: &[&str]) -> PathBuf {
        self.plugin_with(id, dependencies, &[], false)
    }

    fn plugin_with(
        &mut self,
        id: &str,
        dependencies: &[&str],
        permissions: &[&str],
        fail_initialize: bool,
    ) -> PathBuf {
        let manifest = write_manifest(self.root.path(), id, dependencies, permissions);

        let journal = self.journal.clone();
        let plugin_id = id.to_string();
        self.activator.register(id, move || {
            Arc::new(Recorder {
                id: plugin_id.clone(),
                journal: journal.clone(),
                fail_initialize,
            })
        });
        manifest
    }

    fn host(&self) -> PluginHost {
        self.host_with(HostConfig::default())
    }

    fn host_with(&self, mut config: HostConfig) -> PluginHost {
        config.plugins.directory = Some(self.root.path().to_path_buf());
        PluginHost::with_activator(config, Arc::new(self.activator.clone())).expect("host")
    }
}

fn write_manifest(root: &Path, id: &str, dependencies: &[&str], permissions: &[&str]) -> PathBuf {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).expect("plugin dir");
    std::fs::write(dir.join(format!("{id}.so")), id.as_bytes()).expect("assembly");

    let dependencies: Vec<_> = dependencies
        .iter()
        .map(|dep| json!({ "AddinId": dep, "Version": "1.0+" }))
        .collect();
    let manifest = json!({
        "Addin": {
            "Id": id,
            "Name": id,
            "Version": "1.0.0",
            "Runtime": { "Assembly": format!("{id}.so"), "TypeName": id },
            "Dependencies": dependencies,
            "Permissions": { "Required": permissions },
        }
    });
    let path = dir.join(format!("{id}.addin.json"));
    std::fs::write(&path, manifest.to_string()).expect("manifest");
    path
}

#[tokio::test]
async fn test_dependencies_start_first() {
    let mut fixture = Fixture::new();
    fixture.plugin("viewer", &["trace"]);
    fixture.plugin("exporter", &["trace", "viewer"]);
    fixture.plugin("trace", &[]);
    let host = fixture.host();

    let report = host.discover_and_load(fixture.root.path()).await.unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.loaded, vec!["trace", "viewer", "exporter"]);
    assert_eq!(
        fixture.journal.with_prefix("start "),
        vec!["trace", "viewer", "exporter"]
    );
    for id in ["trace", "viewer", "exporter"] {
        assert_eq!(host.lifecycle().phase(id), Some(LifecyclePhase::Running));
        assert!(host.is_enabled(id));
        assert!(host.descriptor(id).unwrap().loaded_time.is_some());
    }
}

#[tokio::test]
async fn test_unload_stops_dependents_first() {
    let mut fixture = Fixture::new();
    fixture.plugin("trace", &[]);
    fixture.plugin("viewer", &["trace"]);
    fixture.plugin("exporter", &["viewer"]);
    fixture.plugin("standalone", &[]);
    let host = fixture.host();
    host.discover_and_load(fixture.root.path()).await.unwrap();

    let handles = host.unload_plugin("trace").await.unwrap();

    assert_eq!(handles.len(), 3);
    assert_eq!(
        fixture.journal.with_prefix("stop "),
        vec!["exporter", "viewer", "trace"]
    );
    assert_eq!(
        fixture.journal.with_prefix("dispose "),
        vec!["exporter", "viewer", "trace"]
    );
    assert_eq!(host.loaded_plugins(), vec!["standalone"]);
    assert!(host.descriptor("viewer").is_none());
    for handle in &handles {
        assert!(handle.wait_for_reclaim(Duration::from_secs(1)).await);
    }
}

#[tokio::test]
async fn test_invalid_plugin_is_kept_with_errors() {
    let mut fixture = Fixture::new();
    fixture.plugin("scope", &[]);
    let mut config = HostConfig::default();
    config.plugins.require_signature = true;
    let host = fixture.host_with(config);

    let report = host.discover_and_load(fixture.root.path()).await.unwrap();

    assert!(report.loaded.is_empty());
    assert_eq!(report.failed.len(), 1);
    let scope = host.descriptor("scope").unwrap();
    assert_eq!(scope.state, PluginState::Failed);
    assert!(host.errors("scope")[0].contains("Signature file"));
    assert!(fixture.journal.entries().is_empty());
}

#[tokio::test]
async fn test_dependent_of_failed_plugin_is_not_started() {
    let mut fixture = Fixture::new();
    fixture.plugin_with("trace", &[], &[], true);
    fixture.plugin("viewer", &["trace"]);
    let host = fixture.host();

    let report = host.discover_and_load(fixture.root.path()).await.unwrap();

    assert!(report.loaded.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert_eq!(host.descriptor("viewer").unwrap().state, PluginState::Failed);
    assert!(
        host.errors("viewer")
            .iter()
            .any(|e| e.contains("'trace'") && e.contains("not running"))
    );
    assert_eq!(fixture.journal.entries(), vec!["init trace"]);
}

#[tokio::test]
async fn test_missing_assembly_is_a_discovery_failure() {
    let mut fixture = Fixture::new();
    fixture.plugin("trace", &[]);
    fixture.plugin("scope", &[]);
    std::fs::remove_file(fixture.root.path().join("trace").join("trace.so")).unwrap();
    let host = fixture.host();

    let report = host.discover_and_load(fixture.root.path()).await.unwrap();

    assert_eq!(report.loaded, vec!["scope"]);
    assert_eq!(report.discovery_failures.len(), 1);
    assert!(!report.is_success());
    assert!(host.descriptor("trace").is_none());
}

#[tokio::test]
async fn test_cycle_fails_the_batch() {
    let mut fixture = Fixture::new();
    fixture.plugin("left", &["right"]);
    fixture.plugin("right", &["left"]);
    let host = fixture.host();

    let err = host
        .discover_and_load(fixture.root.path())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::CircularDependency(_)));
    assert!(host.loaded_plugins().is_empty());
}

#[tokio::test]
async fn test_failed_initialize_cleans_up() {
    let mut fixture = Fixture::new();
    fixture.plugin_with("brittle", &[], &["Network"], true);
    let metrics = Arc::new(CountingMetrics::default());
    let host = fixture.host();
    host.services()
        .register_singleton::<dyn PluginMetrics>(metrics.clone());

    let report = host.discover_and_load(fixture.root.path()).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1[0].contains("refuses to initialize"));
    assert_eq!(host.permissions().granted("brittle"), Permission::NONE);
    assert_eq!(host.lifecycle().phase("brittle"), None);
    assert_eq!(host.descriptor("brittle").unwrap().state, PluginState::Failed);
    assert_eq!(metrics.failed.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.loaded.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_plugins_answer_requests_over_the_bus() {
    let fixture = Fixture::new();
    write_manifest(fixture.root.path(), "echo", &[], &[]);
    let activator = StaticActivator::new().with("echo", || Arc::new(Echo));
    let mut config = HostConfig::default();
    config.plugins.directory = Some(fixture.root.path().to_path_buf());
    let host = PluginHost::with_activator(config, Arc::new(activator)).unwrap();

    host.discover_and_load(fixture.root.path()).await.unwrap();
    let reply: String = host
        .bus()
        .request("echo.upper", "trace".to_string(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, "TRACE");

    host.unload_plugin("echo").await.unwrap();
    assert_eq!(host.bus().subscriber_count("echo.upper"), 0);
}

#[tokio::test]
async fn test_permissions_are_capped_by_policy() {
    let mut fixture = Fixture::new();
    fixture.plugin_with("scope", &[], &["FileSystem", "Network"], false);
    let mut config = HostConfig::default();
    config.plugins.allowed_permissions = vec!["FileSystem".to_string()];
    let host = fixture.host_with(config);

    host.discover_and_load(fixture.root.path()).await.unwrap();

    assert_eq!(host.permissions().granted("scope"), Permission::FILE_SYSTEM);
    assert!(matches!(
        host.permissions()
            .check_permission("scope", Permission::NETWORK),
        Err(PluginError::PermissionDenied { .. })
    ));
}

#[tokio::test]
async fn test_reload_restores_dependents() {
    let mut fixture = Fixture::new();
    fixture.plugin("trace", &[]);
    fixture.plugin("viewer", &["trace"]);
    let host = fixture.host();
    host.discover_and_load(fixture.root.path()).await.unwrap();

    host.reload_plugin("trace").await.unwrap();

    assert_eq!(host.loaded_plugins(), vec!["trace", "viewer"]);
    assert_eq!(
        fixture.journal.with_prefix("start "),
        vec!["trace", "viewer", "trace", "viewer"]
    );
}

#[tokio::test]
async fn test_enable_disable_and_stop_start() {
    let mut fixture = Fixture::new();
    fixture.plugin("scope", &[]);
    let host = fixture.host();
    host.discover_and_load(fixture.root.path()).await.unwrap();

    host.disable("scope").await.unwrap();
    assert!(!host.is_enabled("scope"));
    host.enable("scope").await.unwrap();
    assert!(host.is_enabled("scope"));

    host.stop_plugin("scope").await.unwrap();
    assert_eq!(host.descriptor("scope").unwrap().state, PluginState::Stopped);

    host.start_plugin("scope").await.unwrap();
    assert_eq!(host.lifecycle().phase("scope"), Some(LifecyclePhase::Running));
    assert_eq!(
        fixture.journal.with_prefix("start "),
        vec!["scope", "scope"]
    );
    assert!(fixture.journal.entries().contains(&"disable scope".to_string()));
}

#[tokio::test]
async fn test_admin_script_continues_after_failure() {
    let mut fixture = Fixture::new();
    fixture.plugin("scope", &[]);
    let host = fixture.host();
    host.discover_and_load(fixture.root.path()).await.unwrap();

    let results = host
        .execute_script(vec![
            AdminCommand::Reload {
                id: "missing".into(),
            },
            AdminCommand::Configure {
                id: "scope".into(),
                key: "rate".into(),
                value: json!(100),
            },
            AdminCommand::Stop { id: "scope".into() },
        ])
        .await;

    assert!(!results[0].is_success);
    assert!(results[1].is_success);
    assert!(results[2].is_success);
    assert_eq!(host.get_configuration("scope").unwrap()["rate"], json!(100));
    assert_eq!(host.list_plugins()[0].state, PluginState::Stopped);
}

#[tokio::test]
async fn test_shutdown_and_load_limits() {
    let mut fixture = Fixture::new();
    fixture.plugin("trace", &[]);
    fixture.plugin("viewer", &["trace"]);
    let host = fixture.host();
    let limit = Arc::new(LoadConcurrency::new(1));
    host.services().register_singleton(Arc::clone(&limit));

    host.discover_and_load(fixture.root.path()).await.unwrap();
    assert_eq!(limit.available(), 1);

    let handles = host.shutdown().await;
    assert_eq!(handles.len(), 2);
    assert!(host.plugins().is_empty());
    assert_eq!(
        fixture.journal.with_prefix("stop "),
        vec!["viewer", "trace"]
    );
}

#[tokio::test]
async fn test_duplicate_load_is_rejected() {
    let mut fixture = Fixture::new();
    let manifest = fixture.plugin("scope", &[]);
    let host = fixture.host();

    host.load_plugin_from_path(&manifest).await.unwrap();
    let err = host.load_plugin_from_path(&manifest).await.unwrap_err();
    assert!(matches!(err, PluginError::DuplicatePlugin(ref id) if id == "scope"));
}
