//! Distro Replication Core
//!
//! Availability-first replication of per-resource state across a cluster.
//! Every node is writable; local writes are debounced, pushed to each peer
//! by a sharded worker pool, retried on failure, and periodically
//! reconciled through checksum summaries.
//!
//! ```text
//! write ──► DelayTaskEngine ──► ExecuteEngine ──► TaskExecutor ──► TransportAgent
//!               ▲                 (per-key shard)       │
//!               └────── RetryBus ◄──── failure ─────────┘
//!
//! VerifyTask ──► summary ──► peer ──► on_receive_verify ──► Pull tasks
//! ```

pub mod component;
pub mod config;
pub mod delay;
pub mod error;
pub mod load;
pub mod ownership;
pub mod ports;
pub mod protocol;
pub mod retry;
pub mod task;
pub mod types;
pub mod verify;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use component::{ComponentRegistry, DistroComponent};
pub use config::{ConfigError, DistroConfig, SharedDistroConfig};
pub use delay::{DelayTask, DelayTaskEngine, DelayTaskProcessor, WorkerDispatcher};
pub use error::{DistroError, Result};
pub use load::SnapshotLoader;
pub use ownership::OwnershipMapper;
pub use protocol::{ChangeListener, DistroProtocol};
pub use retry::{RetryBus, RetryEvent, RetryPublisher};
pub use task::TaskExecutor;
pub use types::{
    payload_checksum, ChangeKind, ChecksumSummary, Digest, HLCTimestamp, PeerAddr, ReplicationKey,
    ReplicationRecord,
};
pub use verify::{VerifyDecision, VerifyRound, VerifyTask};
pub use worker::{ExecuteEngine, ExecuteTask, TaskHandler};
