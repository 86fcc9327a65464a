//! Type-identifier registries for workspace sources and publishers.
//!
//! Registries are filled once while the process starts and shared read-only
//! afterwards (usually behind an `Arc`). They never log: reporting a failed
//! resolution is the caller's job.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{SourceDescriptor, TargetDescriptor};
use crate::error::SyncError;
use crate::publish::Publisher;
use crate::source::WorkspaceSource;

/// Builds an instance from its configuration.
pub type Factory<T, C> = Arc<dyn Fn(&C) -> Result<Arc<T>, SyncError> + Send + Sync>;

/// Factory for workspace sources.
pub type SourceFactory = Factory<dyn WorkspaceSource, SourceDescriptor>;

/// Factory for publishers.
pub type PublisherFactory = Factory<dyn Publisher, TargetDescriptor>;

/// Maps source type identifiers (`"folder"`, `"git"`, ...) to factories.
pub type ProviderRegistry = TypeRegistry<dyn WorkspaceSource, SourceDescriptor>;

/// Maps publish target type identifiers (`"folder"`, `"ftp"`, ...) to factories.
pub type PublisherRegistry = TypeRegistry<dyn Publisher, TargetDescriptor>;

/// Registry of factories keyed by type identifier.
///
/// # Example
///
/// ```ignore
/// let mut providers = ProviderRegistry::new();
/// providers.register_fn("folder", |d: &SourceDescriptor| {
///     let source: Arc<dyn WorkspaceSource> = Arc::new(FolderSource::from_descriptor(d)?);
///     Ok(source)
/// })?;
///
/// let source = providers.resolve("folder", &descriptor)?;
/// ```
pub struct TypeRegistry<T: ?Sized, C> {
    factories: HashMap<String, Factory<T, C>>,
}

impl<T: ?Sized + 'static, C: 'static> TypeRegistry<T, C> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory for `type_id`.
    ///
    /// Registering the same factory (the same `Arc`) twice is a no-op; a
    /// different factory for an existing type is rejected.
    ///
    /// # Errors
    /// Returns `SyncError::DuplicateType` on a conflicting registration.
    pub fn register(&mut self, type_id: &str, factory: Factory<T, C>) -> Result<(), SyncError> {
        if let Some(existing) = self.factories.get(type_id) {
            if Arc::ptr_eq(existing, &factory) {
                return Ok(());
            }
            return Err(SyncError::DuplicateType(type_id.to_string()));
        }
        self.factories.insert(type_id.to_string(), factory);
        Ok(())
    }

    /// Register a closure as the factory for `type_id`.
    ///
    /// Returns the shared factory so it can be registered again elsewhere.
    pub fn register_fn<F>(&mut self, type_id: &str, f: F) -> Result<Factory<T, C>, SyncError>
    where
        F: Fn(&C) -> Result<Arc<T>, SyncError> + Send + Sync + 'static,
    {
        let factory: Factory<T, C> = Arc::new(f);
        self.register(type_id, factory.clone())?;
        Ok(factory)
    }

    /// Build an instance of `type_id` from `config`.
    ///
    /// Never retries and never falls back to another type.
    ///
    /// # Errors
    /// `SyncError::UnknownType` when nothing is registered for `type_id`,
    /// `SyncError::Instantiation` wrapping the factory's own error.
    pub fn resolve(&self, type_id: &str, config: &C) -> Result<Arc<T>, SyncError> {
        let factory = self
            .factories
            .get(type_id)
            .ok_or_else(|| SyncError::UnknownType {
                type_id: type_id.to_string(),
                available: self.types().join(", "),
            })?;

        factory(config).map_err(|e| SyncError::Instantiation {
            type_id: type_id.to_string(),
            source: Box::new(e),
        })
    }

    /// Check if a factory is registered for `type_id`.
    pub fn has(&self, type_id: &str) -> bool {
        self.factories.contains_key(type_id)
    }

    /// Registered type identifiers, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl<T: ?Sized + 'static, C: 'static> Default for TypeRegistry<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static, C: 'static> fmt::Debug for TypeRegistry<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Hello(String);

    impl Greeter for Hello {
        fn greet(&self) -> String {
            format!("hello {}", self.0)
        }
    }

    type GreeterRegistry = TypeRegistry<dyn Greeter, String>;

    fn hello_factory() -> Factory<dyn Greeter, String> {
        Arc::new(|name: &String| -> Result<Arc<dyn Greeter>, SyncError> {
            let greeter: Arc<dyn Greeter> = Arc::new(Hello(name.clone()));
            Ok(greeter)
        })
    }

    #[test]
    fn test_registry_new() {
        let registry = GreeterRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.types().is_empty());
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = GreeterRegistry::new();
        registry.register("hello", hello_factory()).unwrap();

        assert!(registry.has("hello"));
        let greeter = registry.resolve("hello", &"world".to_string()).unwrap();
        assert_eq!(greeter.greet(), "hello world");
    }

    #[test]
    fn test_resolve_unknown_type() {
        let mut registry = GreeterRegistry::new();
        registry.register("hello", hello_factory()).unwrap();

        match registry.resolve("bonjour", &"world".to_string()) {
            Err(SyncError::UnknownType { type_id, available }) => {
                assert_eq!(type_id, "bonjour");
                assert_eq!(available, "hello");
            }
            _ => panic!("Expected UnknownType error"),
        }
    }

    #[test]
    fn test_same_factory_twice_is_idempotent() {
        let mut registry = GreeterRegistry::new();
        let factory = hello_factory();
        registry.register("hello", factory.clone()).unwrap();
        registry.register("hello", factory).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_factory_rejected() {
        let mut registry = GreeterRegistry::new();
        registry.register("hello", hello_factory()).unwrap();

        let result = registry.register("hello", hello_factory());
        assert!(matches!(result, Err(SyncError::DuplicateType(t)) if t == "hello"));
    }

    #[test]
    fn test_register_fn_returns_reusable_factory() {
        let mut first = GreeterRegistry::new();
        let factory = first
            .register_fn("hello", |name: &String| {
                let greeter: Arc<dyn Greeter> = Arc::new(Hello(name.to_uppercase()));
                Ok(greeter)
            })
            .unwrap();

        // Same Arc is accepted again
        first.register("hello", factory.clone()).unwrap();

        let mut second = GreeterRegistry::new();
        second.register("shout", factory).unwrap();
        let greeter = second.resolve("shout", &"bob".to_string()).unwrap();
        assert_eq!(greeter.greet(), "hello BOB");
    }

    #[test]
    fn test_factory_error_is_wrapped() {
        let mut registry = GreeterRegistry::new();
        registry
            .register_fn("strict", |name: &String| {
                if name.is_empty() {
                    return Err(SyncError::Configuration("name is required".to_string()));
                }
                let greeter: Arc<dyn Greeter> = Arc::new(Hello(name.clone()));
                Ok(greeter)
            })
            .unwrap();

        match registry.resolve("strict", &String::new()) {
            Err(SyncError::Instantiation { type_id, source }) => {
                assert_eq!(type_id, "strict");
                assert!(matches!(*source, SyncError::Configuration(_)));
            }
            _ => panic!("Expected Instantiation error"),
        }
    }

    #[test]
    fn test_types_sorted_and_debug() {
        let mut registry = GreeterRegistry::new();
        registry.register("zeta", hello_factory()).unwrap();
        registry.register("alpha", hello_factory()).unwrap();
        assert_eq!(registry.types(), vec!["alpha", "zeta"]);

        let debug = format!("{:?}", registry);
        assert!(debug.contains("TypeRegistry"));
        assert!(debug.contains("alpha"));
    }
}
