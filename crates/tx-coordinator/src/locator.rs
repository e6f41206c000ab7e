//! # Backend Locator
//!
//! Resolves the transaction-manager backend named by configuration and caches
//! the single process-wide instance.
//!
//! ## Initialization
//!
//! [`BackendLocator::resolve`] uses double-checked locking: the common path
//! takes a read lock and clones the cached handle; the first caller to find
//! the cache empty takes the write lock, checks again, and constructs the
//! backend. Exactly one factory instance is created no matter how many
//! threads race. A failed resolution caches nothing and surfaces as a
//! configuration error; it is not retried automatically.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::adapters::{InMemoryTransactionFactory, IN_MEMORY_BACKEND};
use crate::config::CoordinatorConfig;
use crate::domain::{BackendError, CoordinatorError};
use crate::ports::{Connection, TransactionFactory, TransactionManager, UserTransaction};

/// Constructor registered for a backend identifier.
pub type BackendConstructor =
    Arc<dyn Fn() -> Result<Arc<dyn TransactionFactory>, BackendError> + Send + Sync>;

lazy_static! {
    static ref GLOBAL_LOCATOR: Arc<BackendLocator> = Arc::new(BackendLocator::new(
        &CoordinatorConfig::from_env(),
        BackendRegistry::default(),
    ));
}

/// Maps backend identifiers to constructors.
#[derive(Clone)]
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    /// Registry with no backends.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry knowing the built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(IN_MEMORY_BACKEND, InMemoryTransactionFactory::create);
        registry
    }

    /// Register `constructor` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> bool
    where
        F: Fn() -> Result<Arc<dyn TransactionFactory>, BackendError> + Send + Sync + 'static,
    {
        let name = name.into();
        let replaced = self
            .constructors
            .insert(name.clone(), Arc::new(constructor))
            .is_some();
        if replaced {
            warn!(backend = %name, "Backend constructor replaced");
        }
        replaced
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered identifiers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    fn construct(&self, name: &str) -> Result<Arc<dyn TransactionFactory>, CoordinatorError> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            CoordinatorError::configuration(format!(
                "unknown transaction backend '{}' (known: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        constructor().map_err(|e| {
            CoordinatorError::configuration(format!(
                "transaction backend '{}' could not be instantiated",
                name
            ))
            .caused_by(Arc::new(e))
        })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

/// Lazily resolved, process-wide backend handle.
pub struct BackendLocator {
    selector: Option<String>,
    registry: BackendRegistry,
    cached: RwLock<Option<Arc<dyn TransactionFactory>>>,
    instantiations: AtomicUsize,
}

impl BackendLocator {
    /// Locator resolving the backend named by `config` from `registry`.
    pub fn new(config: &CoordinatorConfig, registry: BackendRegistry) -> Self {
        let selector = Some(config.backend.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            selector,
            registry,
            cached: RwLock::new(None),
            instantiations: AtomicUsize::new(0),
        }
    }

    /// Locator already holding `factory`; nothing is resolved by name.
    pub fn with_factory(factory: Arc<dyn TransactionFactory>) -> Self {
        Self {
            selector: Some(factory.name().to_string()),
            registry: BackendRegistry::empty(),
            cached: RwLock::new(Some(factory)),
            instantiations: AtomicUsize::new(0),
        }
    }

    /// Process-wide locator configured from the environment.
    pub fn global() -> Arc<BackendLocator> {
        Arc::clone(&GLOBAL_LOCATOR)
    }

    /// Configured backend identifier.
    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    /// Resolve (once) and return the backend factory.
    pub fn resolve(&self) -> Result<Arc<dyn TransactionFactory>, CoordinatorError> {
        if let Some(factory) = self.cached.read().as_ref() {
            return Ok(Arc::clone(factory));
        }

        let mut slot = self.cached.write();
        if let Some(factory) = slot.as_ref() {
            return Ok(Arc::clone(factory));
        }

        let name = self
            .selector
            .as_deref()
            .ok_or_else(|| CoordinatorError::configuration("no transaction backend configured"))?;
        let factory = self.registry.construct(name)?;
        self.instantiations.fetch_add(1, Ordering::AcqRel);
        info!(backend = %name, name = %factory.name(), "Transaction backend resolved");

        *slot = Some(Arc::clone(&factory));
        Ok(factory)
    }

    /// Whether a backend is currently cached.
    pub fn is_resolved(&self) -> bool {
        self.cached.read().is_some()
    }

    /// How many factories this locator has constructed.
    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::Acquire)
    }

    /// Management API of the backend.
    pub fn manager(&self) -> Result<Arc<dyn TransactionManager>, CoordinatorError> {
        Ok(self.resolve()?.manager())
    }

    /// Demarcation API of the backend.
    pub fn user_transaction(&self) -> Result<Arc<dyn UserTransaction>, CoordinatorError> {
        Ok(self.resolve()?.user_transaction())
    }

    /// Human-readable backend name.
    pub fn backend_name(&self) -> Result<String, CoordinatorError> {
        Ok(self.resolve()?.name().to_string())
    }

    /// Acquire a connection for `datasource` from the backend.
    pub fn acquire_connection(
        &self,
        datasource: &str,
    ) -> Result<Box<dyn Connection>, CoordinatorError> {
        self.resolve()?.connection(datasource).map_err(|e| {
            CoordinatorError::system(
                format!("could not acquire connection for '{}'", datasource),
                e,
            )
        })
    }

    /// Shut the backend down and drop the cached handle.
    ///
    /// A later [`resolve`](Self::resolve) constructs a fresh backend.
    pub fn shutdown(&self) {
        let factory = self.cached.write().take();
        if let Some(factory) = factory {
            info!(name = %factory.name(), "Shutting down transaction backend");
            factory.shutdown();
        }
    }
}

impl fmt::Debug for BackendLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendLocator")
            .field("selector", &self.selector)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use std::thread;
    use std::time::Duration;

    fn config(backend: &str) -> CoordinatorConfig {
        CoordinatorConfig::default().with_backend(backend)
    }

    #[test]
    fn test_resolves_default_backend() {
        let locator = BackendLocator::new(&CoordinatorConfig::default(), BackendRegistry::default());
        assert!(!locator.is_resolved());
        assert_eq!(locator.backend_name().unwrap(), IN_MEMORY_BACKEND);
        assert!(locator.is_resolved());
        assert_eq!(locator.instantiations(), 1);
    }

    #[test]
    fn test_missing_selector_is_configuration_error() {
        let locator = BackendLocator::new(&config(""), BackendRegistry::default());
        let err = locator.resolve().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_unknown_selector_is_configuration_error() {
        let locator = BackendLocator::new(&config("jotm"), BackendRegistry::default());
        let err = locator.resolve().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.message().contains("jotm"));
        assert!(!locator.is_resolved());
    }

    #[test]
    fn test_failing_constructor_is_configuration_error() {
        let mut registry = BackendRegistry::empty();
        registry.register("broken", || Err(BackendError::System("no license".into())));
        let locator = BackendLocator::new(&config("broken"), registry);

        let err = locator.resolve().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.root_cause().to_string().contains("no license"));
        assert_eq!(locator.instantiations(), 0);
    }

    #[test]
    fn test_concurrent_resolution_constructs_once() {
        let mut registry = BackendRegistry::empty();
        registry.register("slow", || {
            thread::sleep(Duration::from_millis(20));
            InMemoryTransactionFactory::create()
        });
        let locator = Arc::new(BackendLocator::new(&config("slow"), registry));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locator = Arc::clone(&locator);
                thread::spawn(move || locator.resolve().unwrap())
            })
            .collect();
        let factories: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(locator.instantiations(), 1);
        assert!(factories.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_shutdown_drops_cached_backend() {
        let locator = BackendLocator::new(&CoordinatorConfig::default(), BackendRegistry::default());
        locator.resolve().unwrap();
        locator.shutdown();
        assert!(!locator.is_resolved());
        locator.resolve().unwrap();
        assert_eq!(locator.instantiations(), 2);
    }

    #[test]
    fn test_acquire_connection_delegates_to_backend() {
        let locator = BackendLocator::with_factory(Arc::new(InMemoryTransactionFactory::new()));
        let conn = locator.acquire_connection("orders").unwrap();
        assert_eq!(conn.datasource(), "orders");

        let err = locator.acquire_connection("").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::System);
    }

    #[test]
    fn test_registry_replacement_and_names() {
        let mut registry = BackendRegistry::with_defaults();
        assert!(registry.contains(IN_MEMORY_BACKEND));
        assert!(registry.register(IN_MEMORY_BACKEND, InMemoryTransactionFactory::create));
        assert!(!registry.register("other", InMemoryTransactionFactory::create));
        assert_eq!(registry.names(), vec!["in-memory".to_string(), "other".to_string()]);
    }
}
