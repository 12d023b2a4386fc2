//! Minimal service registry.
//!
//! A [`ServiceCollection`] records how to produce services keyed by their
//! type; [`ServiceCollection::build_service_provider`] freezes it into a
//! [`ServiceProvider`] that resolves them. Trait objects are registered as
//! `Arc<dyn Trait>`. When a type is registered more than once the last
//! registration is the one resolved.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::error::KormError;

type BoxedService = Box<dyn Any + Send + Sync>;
type ServiceFactory =
    Arc<dyn Fn(&ServiceProvider) -> Result<BoxedService, KormError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLifetime {
    /// Created once per provider, on first resolution.
    Singleton,
    /// Created on every resolution.
    Transient,
}

#[derive(Clone)]
struct ServiceDescriptor {
    type_id: TypeId,
    type_name: &'static str,
    lifetime: ServiceLifetime,
    factory: ServiceFactory,
}

#[derive(Clone, Default)]
pub struct ServiceCollection {
    descriptors: Vec<ServiceDescriptor>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_singleton<T>(&mut self, instance: T) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.add_singleton_with(move |_| Ok(instance.clone()))
    }

    /// Singleton built lazily by `factory` the first time it is resolved.
    pub fn add_singleton_with<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceProvider) -> Result<T, KormError> + Send + Sync + 'static,
    {
        self.push(ServiceLifetime::Singleton, factory)
    }

    /// Register `instance` only if `T` has no registration yet. Returns
    /// whether it was added.
    pub fn try_add_singleton<T>(&mut self, instance: T) -> bool
    where
        T: Clone + Send + Sync + 'static,
    {
        if self.contains::<T>() {
            return false;
        }
        self.add_singleton(instance);
        true
    }

    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceProvider) -> Result<T, KormError> + Send + Sync + 'static,
    {
        self.push(ServiceLifetime::Transient, factory)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.lifetime_of::<T>().is_some()
    }

    /// Lifetime of the registration that would be resolved for `T`.
    pub fn lifetime_of<T: 'static>(&self) -> Option<ServiceLifetime> {
        let type_id = TypeId::of::<T>();
        self.descriptors
            .iter()
            .rev()
            .find(|d| d.type_id == type_id)
            .map(|d| d.lifetime)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn build_service_provider(&self) -> ServiceProvider {
        ServiceProvider {
            singletons: self.descriptors.iter().map(|_| OnceCell::new()).collect(),
            descriptors: self.descriptors.clone(),
        }
    }

    fn push<T, F>(&mut self, lifetime: ServiceLifetime, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceProvider) -> Result<T, KormError> + Send + Sync + 'static,
    {
        if self.contains::<T>() {
            debug!(
                service = type_name::<T>(),
                ?lifetime,
                "service registration overrides an earlier one"
            );
        }

        self.descriptors.push(ServiceDescriptor {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            lifetime,
            factory: Arc::new(move |provider| {
                factory(provider).map(|service| Box::new(service) as BoxedService)
            }),
        });
        self
    }
}

impl fmt::Debug for ServiceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.descriptors
                    .iter()
                    .map(|d| format!("{} ({:?})", d.type_name, d.lifetime)),
            )
            .finish()
    }
}

/// Resolves services registered in a [`ServiceCollection`].
pub struct ServiceProvider {
    descriptors: Vec<ServiceDescriptor>,
    singletons: Vec<OnceCell<BoxedService>>,
}

impl ServiceProvider {
    /// `Ok(None)` when `T` is not registered; factory errors are returned as is.
    pub fn get_service<T>(&self) -> Result<Option<T>, KormError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        let Some(index) = self.descriptors.iter().rposition(|d| d.type_id == type_id) else {
            return Ok(None);
        };
        let descriptor = &self.descriptors[index];

        let service = match descriptor.lifetime {
            ServiceLifetime::Transient => (descriptor.factory)(self)?
                .downcast::<T>()
                .ok()
                .map(|service| *service),
            ServiceLifetime::Singleton => self.singletons[index]
                .get_or_try_init(|| (descriptor.factory)(self))?
                .downcast_ref::<T>()
                .cloned(),
        };

        match service {
            Some(service) => Ok(Some(service)),
            None => Err(KormError::ServiceNotRegistered {
                service: type_name::<T>(),
            }),
        }
    }

    pub fn get_required_service<T>(&self) -> Result<T, KormError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.get_service::<T>()?
            .ok_or(KormError::ServiceNotRegistered {
                service: type_name::<T>(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    struct French;

    impl Greeter for French {
        fn greet(&self) -> String {
            "bonjour".to_string()
        }
    }

    #[test]
    fn transient_factory_runs_on_every_resolution() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();

        let mut services = ServiceCollection::new();
        services.add_transient::<Arc<dyn Greeter>, _>(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(English) as Arc<dyn Greeter>)
        });

        assert_eq!(created.load(Ordering::SeqCst), 0);

        let provider = services.build_service_provider();
        let a = provider.get_required_service::<Arc<dyn Greeter>>().unwrap();
        let b = provider.get_required_service::<Arc<dyn Greeter>>().unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.greet(), "hello");
    }

    #[test]
    fn singleton_factory_runs_once_per_provider() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();

        let mut services = ServiceCollection::new();
        services.add_singleton_with(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(English) as Arc<dyn Greeter>)
        });

        let provider = services.build_service_provider();
        let a = provider.get_required_service::<Arc<dyn Greeter>>().unwrap();
        let b = provider.get_required_service::<Arc<dyn Greeter>>().unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn last_registration_wins() {
        let mut services = ServiceCollection::new();
        services
            .add_singleton(Arc::new(English) as Arc<dyn Greeter>)
            .add_transient::<Arc<dyn Greeter>, _>(|_| Ok(Arc::new(French) as Arc<dyn Greeter>));

        assert_eq!(services.len(), 2);
        assert_eq!(
            services.lifetime_of::<Arc<dyn Greeter>>(),
            Some(ServiceLifetime::Transient)
        );

        let provider = services.build_service_provider();
        let greeter = provider.get_required_service::<Arc<dyn Greeter>>().unwrap();
        assert_eq!(greeter.greet(), "bonjour");
    }

    #[test]
    fn try_add_keeps_existing_registration() {
        let mut services = ServiceCollection::new();
        assert!(services.try_add_singleton(1u32));
        assert!(!services.try_add_singleton(2u32));

        let provider = services.build_service_provider();
        assert_eq!(provider.get_required_service::<u32>().unwrap(), 1);
    }

    #[test]
    fn missing_service() {
        let provider = ServiceCollection::new().build_service_provider();
        assert!(provider.get_service::<u32>().unwrap().is_none());
        assert!(matches!(
            provider.get_required_service::<u32>(),
            Err(KormError::ServiceNotRegistered { .. })
        ));
    }

    #[test]
    fn factories_can_resolve_dependencies() {
        let mut services = ServiceCollection::new();
        services
            .add_singleton(String::from("korm"))
            .add_transient(|provider| {
                let name = provider.get_required_service::<String>()?;
                Ok(name.len())
            });

        let provider = services.build_service_provider();
        assert_eq!(provider.get_required_service::<usize>().unwrap(), 4);
    }

    #[test]
    fn factory_errors_propagate() {
        let mut services = ServiceCollection::new();
        services.add_transient::<u64, _>(|_| Err(KormError::config("boom")));

        let provider = services.build_service_provider();
        let err = provider.get_service::<u64>().unwrap_err();
        assert!(matches!(err, KormError::Configuration { message } if message == "boom"));
    }
}
