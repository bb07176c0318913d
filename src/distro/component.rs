//! Component Registry
//!
//! Maps each data type to the collaborators that replicate it.

use crate::distro::error::{DistroError, Result};
use crate::distro::ports::{FailurePolicy, RecordStore, TransportAgent};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Collaborators of one data domain.
#[derive(Clone)]
pub struct DistroComponent {
    pub record_store: Arc<dyn RecordStore>,
    pub transport: Arc<dyn TransportAgent>,
    pub failure_policy: Arc<dyn FailurePolicy>,
}

/// Data type -> component. Written at startup, read by every engine.
#[derive(Default)]
pub struct ComponentRegistry {
    components: DashMap<String, DistroComponent>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data domain. A second registration for the same type fails.
    pub fn register(
        &self,
        data_type: impl Into<String>,
        record_store: Arc<dyn RecordStore>,
        transport: Arc<dyn TransportAgent>,
        failure_policy: Arc<dyn FailurePolicy>,
    ) -> Result<()> {
        let data_type = data_type.into();
        match self.components.entry(data_type.clone()) {
            Entry::Occupied(_) => Err(DistroError::DuplicateComponent(data_type)),
            Entry::Vacant(slot) => {
                slot.insert(DistroComponent {
                    record_store,
                    transport,
                    failure_policy,
                });
                tracing::info!("registered distro component {}", data_type);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, data_type: &str) -> Result<DistroComponent> {
        self.components
            .get(data_type)
            .map(|c| c.value().clone())
            .ok_or_else(|| DistroError::ComponentNotFound(data_type.to_string()))
    }

    /// Registered data types, sorted.
    pub fn data_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.components.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn contains(&self, data_type: &str) -> bool {
        self.components.contains_key(data_type)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::config::SharedDistroConfig;
    use crate::distro::ports::DelayedRetryPolicy;
    use crate::distro::testing::{NullStore, NullTransport};
    use tokio_test::{assert_err, assert_ok};

    fn register(registry: &ComponentRegistry, data_type: &str) -> Result<()> {
        registry.register(
            data_type,
            Arc::new(NullStore),
            Arc::new(NullTransport),
            Arc::new(DelayedRetryPolicy::new(SharedDistroConfig::default())),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ComponentRegistry::new();
        assert!(registry.is_empty());

        assert_ok!(register(&registry, "instances"));
        assert_ok!(register(&registry, "configs"));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("instances"));
        assert_ok!(registry.lookup("instances"));
        assert_eq!(registry.data_types(), vec!["configs", "instances"]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = ComponentRegistry::new();
        register(&registry, "instances").unwrap();

        let err = assert_err!(register(&registry, "instances"));
        assert!(matches!(err, DistroError::DuplicateComponent(ref t) if t == "instances"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_unknown() {
        let registry = ComponentRegistry::new();
        assert!(matches!(
            registry.lookup("missing"),
            Err(DistroError::ComponentNotFound(_))
        ));
    }
}
