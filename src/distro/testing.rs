//! Test doubles shared by the unit tests of the replication core.

use crate::distro::error::{DistroError, Result};
use crate::distro::ports::{RecordStore, TransportAgent};
use crate::distro::types::{
    ChecksumSummary, Digest, HLCTimestamp, PeerAddr, ReplicationKey, ReplicationRecord,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Store that holds nothing.
pub struct NullStore;

#[async_trait]
impl RecordStore for NullStore {
    async fn get_record(&self, resource_id: &str) -> Result<ReplicationRecord> {
        Err(DistroError::not_found("null", resource_id))
    }

    async fn get_verify_summary(&self) -> Option<ReplicationRecord> {
        None
    }

    async fn snapshot(&self) -> Vec<ReplicationRecord> {
        Vec::new()
    }

    async fn apply(&self, _record: &ReplicationRecord) -> Result<bool> {
        Ok(false)
    }

    async fn apply_snapshot(&self, _records: Vec<ReplicationRecord>) -> Result<usize> {
        Ok(0)
    }

    async fn digest(&self, _resource_id: &str) -> Option<Digest> {
        None
    }

    async fn tombstone(&self, _resource_id: &str) -> Option<HLCTimestamp> {
        None
    }
}

/// Transport that accepts everything and delivers nothing.
pub struct NullTransport;

#[async_trait]
impl TransportAgent for NullTransport {
    async fn sync_data(&self, _record: ReplicationRecord, _peer: &PeerAddr) -> Result<bool> {
        Ok(true)
    }

    async fn sync_verify_data(&self, _summary: ReplicationRecord, _peer: &PeerAddr) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, key: &ReplicationKey, _peer: &PeerAddr) -> Result<ReplicationRecord> {
        Err(DistroError::not_found(&key.data_type, &key.resource_id))
    }

    async fn fetch_snapshot(&self, _data_type: &str, _peer: &PeerAddr) -> Result<Vec<ReplicationRecord>> {
        Ok(Vec::new())
    }
}

/// Transport that records calls and fails for selected peers.
#[derive(Default)]
pub struct RecordingTransport {
    pub synced: Mutex<Vec<(PeerAddr, ReplicationRecord)>>,
    pub verified: Mutex<Vec<(PeerAddr, ChecksumSummary)>>,
    pub snapshots: Mutex<Vec<ReplicationRecord>>,
    pub failing: Mutex<HashSet<PeerAddr>>,
    pub fetched: AtomicUsize,
}

impl RecordingTransport {
    pub fn fail(&self, peer: &str) {
        self.failing.lock().insert(PeerAddr::new(peer));
    }

    pub fn heal(&self, peer: &str) {
        self.failing.lock().remove(&PeerAddr::new(peer));
    }

    fn is_failing(&self, peer: &PeerAddr) -> bool {
        self.failing.lock().contains(peer)
    }
}

#[async_trait]
impl TransportAgent for RecordingTransport {
    async fn sync_data(&self, record: ReplicationRecord, peer: &PeerAddr) -> Result<bool> {
        if self.is_failing(peer) {
            return Ok(false);
        }
        self.synced.lock().push((peer.clone(), record));
        Ok(true)
    }

    async fn sync_verify_data(&self, summary: ReplicationRecord, peer: &PeerAddr) -> Result<()> {
        self.verified.lock().push((peer.clone(), summary.summary));
        if self.is_failing(peer) {
            return Err(DistroError::transport(peer, "unreachable"));
        }
        Ok(())
    }

    async fn fetch(&self, key: &ReplicationKey, peer: &PeerAddr) -> Result<ReplicationRecord> {
        self.fetched.fetch_add(1, Ordering::SeqCst);
        if self.is_failing(peer) {
            return Err(DistroError::transport(peer, "unreachable"));
        }
        self.snapshots
            .lock()
            .iter()
            .find(|r| r.key.resource_id == key.resource_id)
            .cloned()
            .ok_or_else(|| DistroError::not_found(&key.data_type, &key.resource_id))
    }

    async fn fetch_snapshot(&self, _data_type: &str, peer: &PeerAddr) -> Result<Vec<ReplicationRecord>> {
        if self.is_failing(peer) {
            return Err(DistroError::transport(peer, "unreachable"));
        }
        Ok(self.snapshots.lock().clone())
    }
}
