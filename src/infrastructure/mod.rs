//! Infrastructure Layer
//!
//! Cross-cutting runtime concerns shared by the replication engines.

pub mod shutdown;

pub use shutdown::{shutdown_signal, ShutdownController, TaskGuard};
