//! Service registry
//!
//! A small DI container used by the host to look up optional collaborators
//! without a hard dependency on them. Services are stored as `Arc<T>` where
//! `T` may be a trait object (`Arc<dyn Metrics>`).
//!
//! Supported registrations: singleton instances, lazy singletons, transient
//! factories, scoped factories (cached per [`ServiceScope`]), named variants,
//! metadata tags and decorators. Generic services are registered per concrete
//! instantiation.

use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type Erased = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Resolver<'_>) -> Result<Erased> + Send + Sync>;
type Decorator = Arc<dyn Fn(Erased, &Resolver<'_>) -> Erased + Send + Sync>;

/// Metadata attached to a registration
pub type ServiceMetadata = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLifetime {
    Singleton,
    Transient,
    Scoped,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceKey {
    type_id: TypeId,
    name: Option<String>,
}

impl ServiceKey {
    fn of<T: ?Sized + 'static>(name: Option<&str>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: name.map(str::to_string),
        }
    }
}

struct Registration {
    type_id: TypeId,
    service: &'static str,
    lifetime: ServiceLifetime,
    factory: Factory,
    metadata: ServiceMetadata,
    instance: Mutex<Option<Erased>>,
}

#[derive(Default)]
struct RegistryInner {
    registrations: RwLock<HashMap<ServiceKey, Arc<Registration>>>,
    decorators: RwLock<HashMap<TypeId, Vec<Decorator>>>,
}

/// Root service registry
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("registrations", &self.inner.registrations.read().len())
            .finish()
    }
}

/// Resolution context handed to factories
pub struct Resolver<'a> {
    registry: &'a ServiceRegistry,
    scope: Option<&'a ServiceScope>,
}

impl Resolver<'_> {
    pub fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.registry.resolve_key::<T>(&ServiceKey::of::<T>(None), self.scope)
    }

    pub fn try_resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve::<T>().ok()
    }

    pub fn resolve_named<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        self.registry
            .resolve_key::<T>(&ServiceKey::of::<T>(Some(name)), self.scope)
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: Option<&str>,
        lifetime: ServiceLifetime,
        factory: Factory,
        metadata: ServiceMetadata,
    ) {
        let key = ServiceKey::of::<T>(name);
        let registration = Registration {
            type_id: TypeId::of::<T>(),
            service: type_name::<T>(),
            lifetime,
            factory,
            metadata,
            instance: Mutex::new(None),
        };
        debug!(service = type_name::<T>(), ?name, ?lifetime, "Service registered");
        self.inner
            .registrations
            .write()
            .insert(key, Arc::new(registration));
    }

    fn erase_factory<T, F>(factory: F) -> Factory
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        Arc::new(move |resolver: &Resolver<'_>| {
            let service = factory(resolver)?;
            Ok(Arc::new(service) as Erased)
        })
    }

    /// Register an existing instance; decorators are applied on first resolve
    pub fn register_singleton<T: ?Sized + Send + Sync + 'static>(&self, instance: Arc<T>) {
        self.register_singleton_inner::<T>(None, instance);
    }

    pub fn register_singleton_named<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
        instance: Arc<T>,
    ) {
        self.register_singleton_inner::<T>(Some(name), instance);
    }

    fn register_singleton_inner<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: Option<&str>,
        instance: Arc<T>,
    ) {
        let factory = Self::erase_factory::<T, _>(move |_| Ok(Arc::clone(&instance)));
        self.insert::<T>(name, ServiceLifetime::Singleton, factory, ServiceMetadata::new());
    }

    /// Register a lazily created singleton
    pub fn register_singleton_factory<T, F>(&self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        self.insert::<T>(
            None,
            ServiceLifetime::Singleton,
            Self::erase_factory(factory),
            ServiceMetadata::new(),
        );
    }

    /// Register a factory invoked on every resolve
    pub fn register_transient<T, F>(&self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        self.insert::<T>(
            None,
            ServiceLifetime::Transient,
            Self::erase_factory(factory),
            ServiceMetadata::new(),
        );
    }

    /// Register a factory whose result is cached per scope
    pub fn register_scoped<T, F>(&self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        self.insert::<T>(
            None,
            ServiceLifetime::Scoped,
            Self::erase_factory(factory),
            ServiceMetadata::new(),
        );
    }

    /// General form: optional name, any lifetime, metadata tags
    pub fn register_with_metadata<T, F>(
        &self,
        name: Option<&str>,
        lifetime: ServiceLifetime,
        metadata: ServiceMetadata,
        factory: F,
    ) where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        self.insert::<T>(name, lifetime, Self::erase_factory(factory), metadata);
    }

    /// Wrap every instance of `T` created from now on
    pub fn decorate<T, F>(&self, decorator: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<T>, &Resolver<'_>) -> Arc<T> + Send + Sync + 'static,
    {
        let erased: Decorator = Arc::new(move |service: Erased, resolver: &Resolver<'_>| {
            let decorated = service
                .downcast_ref::<Arc<T>>()
                .map(|inner| decorator(Arc::clone(inner), resolver));
            match decorated {
                Some(wrapped) => Arc::new(wrapped) as Erased,
                None => service,
            }
        });
        self.inner
            .decorators
            .write()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(erased);
    }

    pub fn is_registered<T: ?Sized + 'static>(&self) -> bool {
        self.inner
            .registrations
            .read()
            .contains_key(&ServiceKey::of::<T>(None))
    }

    pub fn is_registered_named<T: ?Sized + 'static>(&self, name: &str) -> bool {
        self.inner
            .registrations
            .read()
            .contains_key(&ServiceKey::of::<T>(Some(name)))
    }

    pub fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.resolve_key::<T>(&ServiceKey::of::<T>(None), None)
    }

    /// Resolve an optional collaborator
    pub fn try_resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve::<T>().ok()
    }

    pub fn resolve_named<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        self.resolve_key::<T>(&ServiceKey::of::<T>(Some(name)), None)
    }

    /// Resolve every non-scoped registration of `T` tagged with `key = value`
    pub fn resolve_all_with_metadata<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<Arc<T>>> {
        let mut matching: Vec<(Option<String>, Arc<Registration>)> = self
            .inner
            .registrations
            .read()
            .iter()
            .filter(|(k, r)| {
                k.type_id == TypeId::of::<T>()
                    && r.lifetime != ServiceLifetime::Scoped
                    && r.metadata.get(key).map(String::as_str) == Some(value)
            })
            .map(|(k, r)| (k.name.clone(), Arc::clone(r)))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));

        matching
            .into_iter()
            .map(|(_, registration)| self.materialize::<T>(&registration, None))
            .collect()
    }

    /// Metadata of a registration, if any
    pub fn metadata<T: ?Sized + 'static>(&self, name: Option<&str>) -> Option<ServiceMetadata> {
        self.inner
            .registrations
            .read()
            .get(&ServiceKey::of::<T>(name))
            .map(|r| r.metadata.clone())
    }

    pub fn create_scope(&self) -> ServiceScope {
        ServiceScope {
            registry: self.clone(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_key<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &ServiceKey,
        scope: Option<&ServiceScope>,
    ) -> Result<Arc<T>> {
        let registration = self
            .inner
            .registrations
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ServiceNotRegistered(type_name::<T>().to_string()))?;

        match registration.lifetime {
            ServiceLifetime::Scoped => {
                let scope = scope.ok_or_else(|| Error::ScopeRequired(registration.service.to_string()))?;
                if let Some(existing) = scope.instances.lock().get(key).cloned() {
                    return downcast::<T>(existing, registration.service);
                }
                let created = self.create(&registration, Some(scope))?;
                let stored = scope
                    .instances
                    .lock()
                    .entry(key.clone())
                    .or_insert(created)
                    .clone();
                downcast::<T>(stored, registration.service)
            }
            _ => self.materialize::<T>(&registration, scope),
        }
    }

    fn materialize<T: ?Sized + Send + Sync + 'static>(
        &self,
        registration: &Registration,
        scope: Option<&ServiceScope>,
    ) -> Result<Arc<T>> {
        match registration.lifetime {
            ServiceLifetime::Singleton => {
                if let Some(existing) = registration.instance.lock().clone() {
                    return downcast::<T>(existing, registration.service);
                }
                // The factory runs without the lock held so it can resolve other services;
                // if two callers race, the first stored instance wins.
                let created = self.create(registration, scope)?;
                let stored = registration
                    .instance
                    .lock()
                    .get_or_insert(created)
                    .clone();
                downcast::<T>(stored, registration.service)
            }
            ServiceLifetime::Transient | ServiceLifetime::Scoped => {
                let created = self.create(registration, scope)?;
                downcast::<T>(created, registration.service)
            }
        }
    }

    fn create(&self, registration: &Registration, scope: Option<&ServiceScope>) -> Result<Erased> {
        let resolver = Resolver {
            registry: self,
            scope,
        };
        let mut service = (registration.factory)(&resolver)?;

        let decorators = self
            .inner
            .decorators
            .read()
            .get(&registration.type_id)
            .cloned()
            .unwrap_or_default();
        for decorator in decorators {
            service = decorator(service, &resolver);
        }
        Ok(service)
    }
}

fn downcast<T: ?Sized + Send + Sync + 'static>(erased: Erased, service: &str) -> Result<Arc<T>> {
    erased
        .downcast_ref::<Arc<T>>()
        .cloned()
        .ok_or_else(|| Error::ServiceFactoryFailed {
            service: service.to_string(),
            reason: "registered instance has an unexpected type".to_string(),
        })
}

/// Scope caching scoped services; dropping it releases them
pub struct ServiceScope {
    registry: ServiceRegistry,
    instances: Mutex<HashMap<ServiceKey, Erased>>,
}

impl ServiceScope {
    pub fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.registry
            .resolve_key::<T>(&ServiceKey::of::<T>(None), Some(self))
    }

    pub fn try_resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve::<T>().ok()
    }

    pub fn resolve_named<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        self.registry
            .resolve_key::<T>(&ServiceKey::of::<T>(Some(name)), Some(self))
    }
}
