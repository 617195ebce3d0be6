//! Plugin lifecycle state machine
//!
//! Phases only move forward. `Failed` and `Disposed` are terminal; a plugin
//! in either must be registered again (with a fresh instance) to run.

use crate::{Plugin, PluginContext, PluginError, PluginResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecyclePhase {
    Created,
    Initializing,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Disposing,
    Disposed,
    Failed,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Disposing => "disposing",
            Self::Disposed => "disposed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disposed)
    }

    /// Only later phases are reachable, and nothing leaves a terminal phase
    pub fn can_transition_to(&self, target: LifecyclePhase) -> bool {
        !self.is_terminal() && target > *self
    }

    /// Phases in which a plugin may subscribe to the bus
    pub fn accepts_subscriptions(&self) -> bool {
        (Self::Initializing..=Self::Running).contains(self)
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: LifecyclePhase,
    pub to: LifecyclePhase,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct LifecycleEntry {
    phase: LifecyclePhase,
    history: Vec<PhaseChange>,
}

impl LifecycleEntry {
    fn new() -> Self {
        Self {
            phase: LifecyclePhase::Created,
            history: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct LifecycleManager {
    entries: DashMap<String, LifecycleEntry>,
    operation_timeout: Duration,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl LifecycleManager {
    pub fn new(operation_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            operation_timeout,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Start tracking `plugin_id` in `Created`. Ids that are still live are rejected.
    pub fn register(&self, plugin_id: &str) -> PluginResult<()> {
        if let Some(existing) = self.entries.get(plugin_id) {
            if !existing.phase.is_terminal() {
                return Err(PluginError::DuplicatePlugin(plugin_id.to_string()));
            }
        }
        self.entries
            .insert(plugin_id.to_string(), LifecycleEntry::new());
        debug!(plugin_id, "Lifecycle registered");
        Ok(())
    }

    pub fn phase(&self, plugin_id: &str) -> Option<LifecyclePhase> {
        self.entries.get(plugin_id).map(|entry| entry.phase)
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.entries.contains_key(plugin_id)
    }

    pub fn history(&self, plugin_id: &str) -> Vec<PhaseChange> {
        self.entries
            .get(plugin_id)
            .map(|entry| entry.history.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, plugin_id: &str) -> Option<LifecyclePhase> {
        self.entries
            .remove(plugin_id)
            .map(|(_, entry)| entry.phase)
    }

    pub fn transition(&self, plugin_id: &str, to: LifecyclePhase) -> PluginResult<()> {
        let mut entry = self
            .entries
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        let from = entry.phase;
        if !from.can_transition_to(to) {
            return Err(PluginError::InvalidTransition {
                plugin_id: plugin_id.to_string(),
                from,
                to,
            });
        }

        entry.phase = to;
        entry.history.push(PhaseChange {
            from,
            to,
            at: Utc::now(),
        });
        debug!(plugin_id, %from, %to, "Lifecycle transition");
        Ok(())
    }

    /// Move to `Failed` from any non-terminal phase
    pub fn fail(&self, plugin_id: &str, reason: &str) {
        match self.transition(plugin_id, LifecyclePhase::Failed) {
            Ok(()) => error!(plugin_id, reason, "Plugin failed"),
            Err(e) => debug!(plugin_id, error = %e, "Plugin already terminal"),
        }
    }

    pub async fn initialize(
        &self,
        plugin_id: &str,
        plugin: &dyn Plugin,
        context: PluginContext,
    ) -> PluginResult<()> {
        self.run_hook(
            plugin_id,
            "initialize",
            LifecyclePhase::Initializing,
            LifecyclePhase::Initialized,
            plugin.initialize(context),
        )
        .await
    }

    pub async fn start(&self, plugin_id: &str, plugin: &dyn Plugin) -> PluginResult<()> {
        self.run_hook(
            plugin_id,
            "start",
            LifecyclePhase::Starting,
            LifecyclePhase::Running,
            plugin.start(),
        )
        .await?;
        info!(plugin_id, "Plugin running");
        Ok(())
    }

    pub async fn stop(&self, plugin_id: &str, plugin: &dyn Plugin) -> PluginResult<()> {
        self.run_hook(
            plugin_id,
            "stop",
            LifecyclePhase::Stopping,
            LifecyclePhase::Stopped,
            plugin.stop(),
        )
        .await?;
        info!(plugin_id, "Plugin stopped");
        Ok(())
    }

    pub async fn dispose(&self, plugin_id: &str, plugin: &dyn Plugin) -> PluginResult<()> {
        self.run_hook(
            plugin_id,
            "dispose",
            LifecyclePhase::Disposing,
            LifecyclePhase::Disposed,
            plugin.dispose(),
        )
        .await
    }

    /// Run `on_enable`; only allowed while running or stopped, never moves the phase
    pub async fn enable(&self, plugin_id: &str, plugin: &dyn Plugin) -> PluginResult<()> {
        self.ensure_toggleable(plugin_id, "enable")?;
        self.run_guarded(plugin_id, "enable", plugin.on_enable())
            .await
            .map_err(|reason| PluginError::LifecycleFailed {
                plugin_id: plugin_id.to_string(),
                operation: "enable",
                reason,
            })
    }

    /// Run `on_disable`; only allowed while running or stopped, never moves the phase
    pub async fn disable(&self, plugin_id: &str, plugin: &dyn Plugin) -> PluginResult<()> {
        self.ensure_toggleable(plugin_id, "disable")?;
        self.run_guarded(plugin_id, "disable", plugin.on_disable())
            .await
            .map_err(|reason| PluginError::LifecycleFailed {
                plugin_id: plugin_id.to_string(),
                operation: "disable",
                reason,
            })
    }

    /// Error unless the plugin is in one of `allowed`
    pub fn require_phase(
        &self,
        plugin_id: &str,
        operation: &'static str,
        allowed: impl Fn(LifecyclePhase) -> bool,
    ) -> PluginResult<LifecyclePhase> {
        let phase = self
            .phase(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        if allowed(phase) {
            Ok(phase)
        } else {
            Err(PluginError::InvalidState {
                plugin_id: plugin_id.to_string(),
                phase: phase.to_string(),
                operation,
            })
        }
    }

    fn ensure_toggleable(&self, plugin_id: &str, operation: &'static str) -> PluginResult<()> {
        self.require_phase(plugin_id, operation, |phase| {
            matches!(phase, LifecyclePhase::Running | LifecyclePhase::Stopped)
        })
        .map(|_| ())
    }

    async fn run_hook<F>(
        &self,
        plugin_id: &str,
        operation: &'static str,
        entering: LifecyclePhase,
        completed: LifecyclePhase,
        hook: F,
    ) -> PluginResult<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        self.transition(plugin_id, entering)?;

        match self.run_guarded(plugin_id, operation, hook).await {
            Ok(()) => self.transition(plugin_id, completed),
            Err(reason) => {
                self.fail(plugin_id, &reason);
                Err(PluginError::LifecycleFailed {
                    plugin_id: plugin_id.to_string(),
                    operation,
                    reason,
                })
            }
        }
    }

    /// Await a hook with the operation timeout, converting errors and panics
    async fn run_guarded<F>(
        &self,
        plugin_id: &str,
        operation: &'static str,
        hook: F,
    ) -> Result<(), String>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        let guarded = AssertUnwindSafe(hook).catch_unwind();
        match tokio::time::timeout(self.operation_timeout, guarded).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Err(_)) => Err(format!("{operation} panicked")),
            Err(_) => {
                debug!(plugin_id, operation, "Lifecycle hook timed out");
                Err(format!("{operation} timed out after {:?}", self.operation_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::LifecyclePhase::*;

    #[derive(Default)]
    struct Probe {
        starts: AtomicUsize,
        fail_start: bool,
        hang_stop: bool,
    }

    #[async_trait]
    impl Plugin for Probe {
        async fn initialize(&self, _context: PluginContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                anyhow::bail!("device not present");
            }
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            if self.hang_stop {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    #[test]
    fn test_forward_only_transitions() {
        assert!(Created.can_transition_to(Initializing));
        assert!(Created.can_transition_to(Disposing));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Disposing));
        assert!(!Disposed.can_transition_to(Failed));
    }

    #[test]
    fn test_subscription_window() {
        assert!(!Created.accepts_subscriptions());
        assert!(Initializing.accepts_subscriptions());
        assert!(Starting.accepts_subscriptions());
        assert!(Running.accepts_subscriptions());
        assert!(!Stopping.accepts_subscriptions());
    }

    #[test]
    fn test_register_and_history() {
        let manager = LifecycleManager::default();
        manager.register("p").unwrap();
        assert!(matches!(
            manager.register("p"),
            Err(PluginError::DuplicatePlugin(_))
        ));

        manager.transition("p", Initializing).unwrap();
        let err = manager.transition("p", Created).unwrap_err();
        assert!(matches!(err, PluginError::InvalidTransition { .. }));

        let history = manager.history("p");
        assert_eq!(history.len(), 1);
        assert_eq!((history[0].from, history[0].to), (Created, Initializing));

        manager.fail("p", "boom");
        assert_eq!(manager.phase("p"), Some(Failed));
        manager.register("p").unwrap();
        assert_eq!(manager.phase("p"), Some(Created));
    }

    #[tokio::test]
    async fn test_hook_error_moves_to_failed() {
        let manager = LifecycleManager::default();
        let plugin: Arc<dyn Plugin> = Arc::new(Probe {
            fail_start: true,
            ..Probe::default()
        });
        manager.register("p").unwrap();
        manager.transition("p", Initialized).unwrap();

        let err = manager.start("p", &*plugin).await.unwrap_err();
        match err {
            PluginError::LifecycleFailed {
                operation, reason, ..
            } => {
                assert_eq!(operation, "start");
                assert!(reason.contains("device not present"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(manager.phase("p"), Some(Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_timeout_moves_to_failed() {
        let manager = LifecycleManager::new(Duration::from_secs(2));
        let plugin: Arc<dyn Plugin> = Arc::new(Probe {
            hang_stop: true,
            ..Probe::default()
        });
        manager.register("p").unwrap();
        manager.transition("p", Initialized).unwrap();
        manager.start("p", &*plugin).await.unwrap();

        let err = manager.stop("p", &*plugin).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(manager.phase("p"), Some(Failed));
    }

    #[tokio::test]
    async fn test_enable_requires_running_or_stopped() {
        let manager = LifecycleManager::default();
        let plugin: Arc<dyn Plugin> = Arc::new(Probe::default());
        manager.register("p").unwrap();

        let err = manager.enable("p", &*plugin).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidState { .. }));

        manager.transition("p", Initialized).unwrap();
        manager.start("p", &*plugin).await.unwrap();
        manager.disable("p", &*plugin).await.unwrap();
        manager.enable("p", &*plugin).await.unwrap();
        assert_eq!(manager.phase("p"), Some(Running));

        manager.stop("p", &*plugin).await.unwrap();
        manager.enable("p", &*plugin).await.unwrap();
        manager.dispose("p", &*plugin).await.unwrap();
        assert!(manager.enable("p", &*plugin).await.is_err());
    }
}
