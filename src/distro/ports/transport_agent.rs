//! Transport Agent Port
//!
//! Ships replication payloads and verify requests to one peer.

use crate::distro::error::Result;
use crate::distro::types::{PeerAddr, ReplicationKey, ReplicationRecord};
use async_trait::async_trait;

/// Network abstraction for one data domain.
///
/// Implementations own their RPC deadlines; the core enforces none.
#[async_trait]
pub trait TransportAgent: Send + Sync {
    /// Push a record. `Ok(true)` means the peer acknowledged application;
    /// `Ok(false)` or an error is a failed sync.
    async fn sync_data(&self, record: ReplicationRecord, peer: &PeerAddr) -> Result<bool>;

    /// Send a checksum summary. Errors are logged by the caller and never retried.
    async fn sync_verify_data(&self, summary: ReplicationRecord, peer: &PeerAddr) -> Result<()>;

    /// Pull the authoritative record for `key` from `peer`.
    async fn fetch(&self, key: &ReplicationKey, peer: &PeerAddr) -> Result<ReplicationRecord>;

    /// Pull every record of a data domain from `peer`.
    async fn fetch_snapshot(&self, data_type: &str, peer: &PeerAddr) -> Result<Vec<ReplicationRecord>>;
}
