//! Distro Replication Library
//!
//! Availability-first (AP) replication of per-resource state across a
//! cluster, plus the adapters needed to run it as a node.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod config;
pub mod distro;
pub mod infrastructure;
pub mod naming;

// Re-export commonly used types
pub use config::load_config;
pub use distro::{
    ChangeKind, DistroConfig, DistroError, DistroProtocol, PeerAddr, ReplicationKey, ReplicationRecord,
    SharedDistroConfig,
};
pub use naming::{Service, ServiceRegistry};
