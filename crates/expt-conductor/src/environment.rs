//! Environment: resources and global variables
//!
//! The conductor consumes a [`GlobalEnvironment`] as an opaque provider.
//! At each conduct it captures a [`LocalEnvironment`], which is what
//! instruction executions see.
//!
//! Resources are handed out as [`ResourceLease`]s. A lease is owned by the
//! instruction that acquired it and released exactly once, when that
//! instruction completes or is interrupted.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{ConductorError, ReleaseError, ResourceError};
use crate::procedure::Variables;
use crate::types::ProductionType;

/// Type-erased shared value
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Exclusive lease on an environment resource
pub trait ResourceLease: Send {
    /// Leased value
    fn value(&self) -> AnyValue;

    /// Give the resource back
    ///
    /// # Errors
    /// Returns [`ResourceError`] if the resource could not be closed cleanly.
    fn release(self: Box<Self>) -> Result<(), ResourceError>;
}

/// Provider of resources and global variables
pub trait GlobalEnvironment: Send + Sync {
    /// Open a lease on a resource type
    ///
    /// # Errors
    /// Returns [`ConductorError::ResourceUnavailable`] if the resource
    /// cannot be provided.
    fn provide_resource(&self, resource: &ProductionType) -> Result<Box<dyn ResourceLease>, ConductorError>;

    /// Variables every instruction inherits
    fn variables(&self) -> Variables {
        Variables::new()
    }
}

/// Environment captured for one conduct
#[derive(Clone)]
pub struct LocalEnvironment {
    global: Arc<dyn GlobalEnvironment>,
    variables: Variables,
}

impl LocalEnvironment {
    /// Capture the current state of a global environment
    #[must_use]
    pub fn capture(global: Arc<dyn GlobalEnvironment>) -> Self {
        let variables = global.variables();
        Self { global, variables }
    }

    /// Global variables at capture time
    #[inline]
    #[must_use]
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Open a lease on a resource type
    ///
    /// # Errors
    /// See [`GlobalEnvironment::provide_resource`].
    pub fn provide_resource(&self, resource: &ProductionType) -> Result<Box<dyn ResourceLease>, ConductorError> {
        self.global.provide_resource(resource)
    }
}

impl fmt::Debug for LocalEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEnvironment")
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

/// Typed view of a leased resource
pub struct Resource<T> {
    resource: ProductionType,
    value: Arc<T>,
}

impl<T> Resource<T> {
    pub(crate) fn new(resource: ProductionType, value: Arc<T>) -> Self {
        Self { resource, value }
    }

    /// Resource type
    #[inline]
    #[must_use]
    pub fn resource_type(&self) -> ProductionType {
        self.resource
    }

    /// Shared handle to the value
    #[inline]
    #[must_use]
    pub fn value(&self) -> Arc<T> {
        Arc::clone(&self.value)
    }
}

impl<T> Deref for Resource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("resource", &self.resource).finish()
    }
}

/// Release every lease, aggregating failures
///
/// All leases are released even if some fail. The first failure becomes
/// the primary error and later ones are suppressed.
///
/// # Errors
/// Returns [`ReleaseError`] if any release failed.
pub fn release_all<I>(leases: I) -> Result<(), ReleaseError>
where
    I: IntoIterator<Item = Box<dyn ResourceLease>>,
{
    let mut failures = leases.into_iter().filter_map(|lease| lease.release().err());
    match failures.next() {
        None => Ok(()),
        Some(primary) => Err(ReleaseError {
            primary,
            suppressed: failures.collect(),
        }),
    }
}

type LeaseFactory = Arc<dyn Fn() -> Result<Box<dyn ResourceLease>, String> + Send + Sync>;

/// Environment with a fixed set of variables and resource factories
#[derive(Default, Clone)]
pub struct StaticEnvironment {
    variables: Variables,
    factories: HashMap<ProductionType, LeaseFactory>,
}

impl StaticEnvironment {
    /// Create an empty environment
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a global variable
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(name, value);
        self
    }

    /// Builder: provide resources of type `T` from a factory
    ///
    /// Leases from this factory release by dropping their value.
    #[must_use]
    pub fn with_resource<T, F>(self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> Result<T, String> + Send + Sync + 'static,
    {
        self.with_lease_factory::<T, _>(move || {
            let value: AnyValue = Arc::new(factory()?);
            Ok(Box::new(DroppedLease(value)) as Box<dyn ResourceLease>)
        })
    }

    /// Builder: provide resources of type `T` as custom leases
    #[must_use]
    pub fn with_lease_factory<T, F>(mut self, factory: F) -> Self
    where
        T: 'static,
        F: Fn() -> Result<Box<dyn ResourceLease>, String> + Send + Sync + 'static,
    {
        self.factories.insert(ProductionType::of::<T>(), Arc::new(factory));
        self
    }
}

impl GlobalEnvironment for StaticEnvironment {
    fn provide_resource(&self, resource: &ProductionType) -> Result<Box<dyn ResourceLease>, ConductorError> {
        let factory = self
            .factories
            .get(resource)
            .ok_or_else(|| ConductorError::ResourceUnavailable {
                resource: resource.to_string(),
                message: "no provider registered".to_string(),
            })?;
        factory().map_err(|message| ConductorError::ResourceUnavailable {
            resource: resource.to_string(),
            message,
        })
    }

    fn variables(&self) -> Variables {
        self.variables.clone()
    }
}

impl fmt::Debug for StaticEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticEnvironment")
            .field("variables", &self.variables)
            .field("resources", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct DroppedLease(AnyValue);

impl ResourceLease for DroppedLease {
    fn value(&self) -> AnyValue {
        Arc::clone(&self.0)
    }

    fn release(self: Box<Self>) -> Result<(), ResourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        name: &'static str,
        fail: bool,
        released: Arc<AtomicUsize>,
    }

    impl ResourceLease for Counted {
        fn value(&self) -> AnyValue {
            Arc::new(self.name)
        }

        fn release(self: Box<Self>) -> Result<(), ResourceError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ResourceError::new(self.name, "stuck"))
            } else {
                Ok(())
            }
        }
    }

    fn lease(name: &'static str, fail: bool, released: &Arc<AtomicUsize>) -> Box<dyn ResourceLease> {
        Box::new(Counted {
            name,
            fail,
            released: Arc::clone(released),
        })
    }

    #[test]
    fn test_release_all_continues_after_failure() {
        let released = Arc::new(AtomicUsize::new(0));
        let error = release_all(vec![
            lease("r1", false, &released),
            lease("r2", true, &released),
            lease("r3", false, &released),
        ])
        .unwrap_err();
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert_eq!(error.primary.resource, "r2");
        assert!(error.suppressed.is_empty());
    }

    #[test]
    fn test_release_all_suppresses_later_failures() {
        let released = Arc::new(AtomicUsize::new(0));
        let error = release_all(vec![
            lease("r1", false, &released),
            lease("r2", true, &released),
            lease("r3", true, &released),
        ])
        .unwrap_err();
        assert_eq!(error.primary.resource, "r2");
        assert_eq!(error.suppressed, vec![ResourceError::new("r3", "stuck")]);
    }

    #[test]
    fn test_static_environment_provides_resources() {
        let environment = StaticEnvironment::new()
            .with_variable("unit", "Da")
            .with_resource::<u32, _>(|| Ok(7));
        let local = LocalEnvironment::capture(Arc::new(environment));
        assert_eq!(local.variables().get_as::<String>("unit").unwrap(), "Da");

        let lease = local.provide_resource(&ProductionType::of::<u32>()).unwrap();
        let value = lease.value().downcast::<u32>().unwrap();
        assert_eq!(*value, 7);
        assert!(lease.release().is_ok());

        let missing = local.provide_resource(&ProductionType::of::<String>());
        assert!(matches!(missing, Err(ConductorError::ResourceUnavailable { .. })));
    }
}
