//! Record Store Port
//!
//! Exposes the current data and checksums of one data domain.

use crate::distro::error::Result;
use crate::distro::types::{Digest, HLCTimestamp, ReplicationRecord};
use async_trait::async_trait;

/// Per-domain data source and sink for replication.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Current record for a resource.
    ///
    /// Fails with `RecordNotFound` if the resource no longer exists locally;
    /// the sync task then propagates a DELETE.
    async fn get_record(&self, resource_id: &str) -> Result<ReplicationRecord>;

    /// Checksum summary (`ChangeKind::Verify`) of the resources this node owns.
    /// `None` means nothing is owned yet.
    async fn get_verify_summary(&self) -> Option<ReplicationRecord>;

    /// Every resource held locally, as `ChangeKind::Snapshot` records.
    async fn snapshot(&self) -> Vec<ReplicationRecord>;

    /// Apply a record received from a peer. Returns whether local state changed.
    async fn apply(&self, record: &ReplicationRecord) -> Result<bool>;

    /// Apply a full snapshot. Returns the number of records that changed local state.
    async fn apply_snapshot(&self, records: Vec<ReplicationRecord>) -> Result<usize>;

    /// Digest of a resource held locally.
    async fn digest(&self, resource_id: &str) -> Option<Digest>;

    /// Version at which a resource was deleted, if it was.
    async fn tombstone(&self, resource_id: &str) -> Option<HLCTimestamp>;
}
