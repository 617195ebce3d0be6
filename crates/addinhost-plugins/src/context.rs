//! Host services handed to a plugin at initialization

use crate::{
    LifecycleManager, LifecyclePhase, LoadedUnit, Permission, PermissionManager, PluginResult,
};
use addinhost_core::bus::{HandlerResult, MessageBus, PublishReport, Subscription};
use addinhost_core::config::ConfigStore;
use addinhost_core::services::ServiceRegistry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Per-plugin view of the host. Cheap to clone.
///
/// Bus subscriptions made through the context are owned by the plugin and
/// removed when it unloads. Each handler holds the plugin's code unit until
/// the handler and every future it returned are dropped. Configuration keys
/// are namespaced by plugin id.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: Arc<str>,
    unit: Arc<LoadedUnit>,
    bus: Arc<MessageBus>,
    permissions: Arc<PermissionManager>,
    lifecycle: Arc<LifecycleManager>,
    config: Arc<ConfigStore>,
    services: Arc<ServiceRegistry>,
    request_timeout: Duration,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl PluginContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugin_id: &str,
        unit: Arc<LoadedUnit>,
        bus: Arc<MessageBus>,
        permissions: Arc<PermissionManager>,
        lifecycle: Arc<LifecycleManager>,
        config: Arc<ConfigStore>,
        services: Arc<ServiceRegistry>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            unit,
            bus,
            permissions,
            lifecycle,
            config,
            services,
            request_timeout,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Subscribe on behalf of the plugin; allowed from `Initializing` through `Running`
    pub fn subscribe<T, F, Fut>(&self, topic: &str, handler: F) -> PluginResult<Subscription>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.lifecycle
            .require_phase(&self.plugin_id, "subscribe", |phase| {
                phase.accepts_subscriptions()
            })?;
        let handler = bind_to_unit(&self.unit, handler);
        Ok(self.bus.subscribe_for(&self.plugin_id, topic, handler))
    }

    /// Answer requests on `topic`; same phase rules as [`Self::subscribe`]
    pub fn serve<Req, Resp, F, Fut>(&self, topic: &str, handler: F) -> PluginResult<Subscription>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.lifecycle
            .require_phase(&self.plugin_id, "serve", |phase| {
                phase.accepts_subscriptions()
            })?;
        let handler = bind_to_unit(&self.unit, handler);
        Ok(self.bus.serve_for(&self.plugin_id, topic, handler))
    }

    pub async fn publish<T>(&self, topic: &str, message: T) -> PublishReport
    where
        T: Clone + Send + Sync + 'static,
    {
        self.bus.publish(topic, message).await
    }

    /// Request with the host's default timeout
    pub async fn request<Req, Resp>(&self, topic: &str, request: Req) -> PluginResult<Resp>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        self.request_with_timeout(topic, request, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout<Req, Resp>(
        &self,
        topic: &str,
        request: Req,
        timeout: Duration,
    ) -> PluginResult<Resp>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        Ok(self.bus.request(topic, request, timeout).await?)
    }

    /// Permission gate for privileged work; the plugin must be running
    pub fn demand(&self, permission: Permission) -> PluginResult<()> {
        self.lifecycle
            .require_phase(&self.plugin_id, "demand permissions", |phase| {
                phase == LifecyclePhase::Running
            })?;
        self.permissions
            .check_permission(&self.plugin_id, permission)
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.has_permission(&self.plugin_id, permission)
    }

    pub fn config_get<T: DeserializeOwned>(&self, key: &str) -> PluginResult<Option<T>> {
        Ok(self
            .config
            .get(&ConfigStore::plugin_key(&self.plugin_id, key))?)
    }

    pub fn config_set<T: Serialize>(&self, key: &str, value: T) -> PluginResult<()> {
        Ok(self
            .config
            .set(&ConfigStore::plugin_key(&self.plugin_id, key), value)?)
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }
}

/// `inner` together with the code unit it must not outlive; `inner` drops first
struct UnitBound<T> {
    inner: T,
    unit: Arc<LoadedUnit>,
}

impl<F: Future + Unpin> Future for UnitBound<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

fn bind_to_unit<A, F, Fut>(
    unit: &Arc<LoadedUnit>,
    handler: F,
) -> impl Fn(A) -> UnitBound<Pin<Box<Fut>>> + Send + Sync + 'static
where
    A: 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
{
    let bound = UnitBound {
        inner: handler,
        unit: Arc::clone(unit),
    };
    move |argument| UnitBound {
        inner: Box::pin((bound.inner)(argument)),
        unit: Arc::clone(&bound.unit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PluginError;

    fn context(lifecycle: Arc<LifecycleManager>) -> (PluginContext, Arc<MessageBus>) {
        context_with_unit(lifecycle, Arc::new(LoadedUnit::in_process("scope")))
    }

    fn context_with_unit(
        lifecycle: Arc<LifecycleManager>,
        unit: Arc<LoadedUnit>,
    ) -> (PluginContext, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new());
        let permissions = Arc::new(PermissionManager::new());
        permissions.grant("scope", Permission::FILE_SYSTEM);
        let context = PluginContext::new(
            "scope",
            unit,
            Arc::clone(&bus),
            permissions,
            lifecycle,
            Arc::new(ConfigStore::new()),
            Arc::new(ServiceRegistry::new()),
            Duration::from_millis(200),
        );
        (context, bus)
    }

    #[test]
    fn test_subscribe_only_while_active() {
        let lifecycle = Arc::new(LifecycleManager::default());
        lifecycle.register("scope").unwrap();
        let (context, bus) = context(Arc::clone(&lifecycle));

        let early = context.subscribe("ticks", |_: u32| async { Ok(()) });
        assert!(matches!(early, Err(PluginError::InvalidState { .. })));

        lifecycle.transition("scope", LifecyclePhase::Initializing).unwrap();
        context.subscribe("ticks", |_: u32| async { Ok(()) }).unwrap();
        assert_eq!(bus.subscriber_count("ticks"), 1);
        assert_eq!(bus.unsubscribe_owner("scope"), 1);
    }

    #[test]
    fn test_subscription_holds_code_unit() {
        let lifecycle = Arc::new(LifecycleManager::default());
        lifecycle.register("scope").unwrap();
        lifecycle.transition("scope", LifecyclePhase::Initializing).unwrap();
        let unit = Arc::new(LoadedUnit::in_process("scope"));
        let unit_ref = Arc::downgrade(&unit);
        let (context, bus) = context_with_unit(Arc::clone(&lifecycle), unit);

        let subscription = context.subscribe("ticks", |_: u32| async { Ok(()) }).unwrap();
        context.serve("echo", |text: String| async move { Ok(text) }).unwrap();
        drop(context);
        assert!(unit_ref.upgrade().is_some());

        assert!(bus.unsubscribe(&subscription));
        assert!(unit_ref.upgrade().is_some());
        assert_eq!(bus.unsubscribe_owner("scope"), 1);
        assert!(unit_ref.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_in_flight_handler_holds_code_unit() {
        let lifecycle = Arc::new(LifecycleManager::default());
        lifecycle.register("scope").unwrap();
        lifecycle.transition("scope", LifecyclePhase::Initializing).unwrap();
        let unit = Arc::new(LoadedUnit::in_process("scope"));
        let unit_ref = Arc::downgrade(&unit);
        let (context, bus) = context_with_unit(Arc::clone(&lifecycle), unit);

        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            context
                .subscribe("ticks", move |_: u32| {
                    let entered = Arc::clone(&entered);
                    let release = Arc::clone(&release);
                    async move {
                        entered.notify_one();
                        release.notified().await;
                        Ok(())
                    }
                })
                .unwrap();
        }
        drop(context);

        let publisher = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.publish("ticks", 1u32).await })
        };
        entered.notified().await;
        assert_eq!(bus.unsubscribe_owner("scope"), 1);
        assert!(unit_ref.upgrade().is_some());

        release.notify_one();
        let report = publisher.await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(unit_ref.upgrade().is_none());
    }

    #[test]
    fn test_demand_requires_running() {
        let lifecycle = Arc::new(LifecycleManager::default());
        lifecycle.register("scope").unwrap();
        let (context, _bus) = context(Arc::clone(&lifecycle));

        assert!(matches!(
            context.demand(Permission::FILE_SYSTEM),
            Err(PluginError::InvalidState { .. })
        ));

        lifecycle.transition("scope", LifecyclePhase::Running).unwrap();
        context.demand(Permission::FILE_SYSTEM).unwrap();
        assert!(matches!(
            context.demand(Permission::FILE_SYSTEM | Permission::NETWORK),
            Err(PluginError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_config_is_namespaced() {
        let lifecycle = Arc::new(LifecycleManager::default());
        let (context, _bus) = context(lifecycle);

        context.config_set("gain", 3.5f64).unwrap();
        assert_eq!(context.config_get::<f64>("gain").unwrap(), Some(3.5));
        assert_eq!(context.config.get::<f64>("scope.gain").unwrap(), Some(3.5));
        assert_eq!(context.config_get::<f64>("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_request_uses_default_timeout() {
        let lifecycle = Arc::new(LifecycleManager::default());
        let (context, _bus) = context(lifecycle);

        let err = context
            .request::<String, String>("nobody.listens", "ping".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Core(ref inner) if inner.is_timeout()));
    }
}
