//! Naming
//!
//! Service identity and the registry that interns one canonical handle per
//! service, so every index keyed by a service shares the same object.

pub mod registry;
pub mod service;

pub use registry::ServiceRegistry;
pub use service::{Service, DEFAULT_GROUP, DEFAULT_NAMESPACE};
