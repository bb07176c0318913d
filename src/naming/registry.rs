//! Service Registry
//!
//! Interning table from service identity to its canonical shared handle.
//! Constructed once per process (or per test) and passed to consumers.

use crate::naming::service::Service;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<Service, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical handle for `candidate`, inserting it if absent.
    ///
    /// Concurrent callers with equal services all receive the same `Arc`.
    pub fn get_singleton(&self, candidate: Service) -> Arc<Service> {
        match self.services.entry(candidate) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let service = Arc::new(entry.key().clone());
                tracing::debug!("registered service {}", service);
                entry.insert(service.clone());
                service
            }
        }
    }

    /// Remove the canonical handle. Returns it if present.
    pub fn remove_singleton(&self, service: &Service) -> Option<Arc<Service>> {
        self.services.remove(service).map(|(_, s)| s)
    }

    /// Remove the service only if no handle outside the registry is alive.
    pub fn remove_if_unused(&self, service: &Service) -> bool {
        self.services
            .remove_if(service, |_, handle| Arc::strong_count(handle) == 1)
            .is_some()
    }

    pub fn contains(&self, service: &Service) -> bool {
        self.services.contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Services registered under `namespace`, sorted.
    pub fn services_in(&self, namespace: &str) -> Vec<Arc<Service>> {
        let mut services: Vec<Arc<Service>> = self
            .services
            .iter()
            .filter(|e| e.key().namespace == namespace)
            .map(|e| e.value().clone())
            .collect();
        services.sort();
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_singleton_interns() {
        let registry = ServiceRegistry::new();
        let a = registry.get_singleton(Service::named("orders"));
        let b = registry.get_singleton(Service::named("orders"));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&Service::named("orders")));
    }

    #[test]
    fn test_remove_singleton() {
        let registry = ServiceRegistry::new();
        let a = registry.get_singleton(Service::named("orders"));

        let removed = registry.remove_singleton(&Service::named("orders")).unwrap();
        assert!(Arc::ptr_eq(&a, &removed));
        assert!(!registry.contains(&Service::named("orders")));
        assert!(registry.remove_singleton(&Service::named("orders")).is_none());

        // Re-registration yields a fresh handle
        let b = registry.get_singleton(Service::named("orders"));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_remove_if_unused() {
        let registry = ServiceRegistry::new();
        let handle = registry.get_singleton(Service::named("orders"));

        assert!(!registry.remove_if_unused(&Service::named("orders")));
        drop(handle);
        assert!(registry.remove_if_unused(&Service::named("orders")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_services_in_namespace() {
        let registry = ServiceRegistry::new();
        registry.get_singleton(Service::new("prod", "g", "b"));
        registry.get_singleton(Service::new("prod", "g", "a"));
        registry.get_singleton(Service::new("dev", "g", "a"));

        let names: Vec<String> = registry.services_in("prod").iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_get_singleton() {
        let registry = Arc::new(ServiceRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_singleton(Service::named("orders")))
            })
            .collect();

        let services: Vec<Arc<Service>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(services.iter().all(|s| Arc::ptr_eq(s, &services[0])));
        assert_eq!(registry.len(), 1);
    }
}
