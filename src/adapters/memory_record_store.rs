//! In-Memory Record Store
//!
//! Implements RecordStore using DashMap. Local writes (`put`/`remove`) stamp
//! a fresh HLC version and notify the change listener; records received from
//! peers go through `apply`, which resolves conflicts by last-write-wins.

use crate::distro::error::{DistroError, Result};
use crate::distro::ports::RecordStore;
use crate::distro::{
    payload_checksum, ChangeKind, ChangeListener, ChecksumSummary, Digest, HLCTimestamp,
    OwnershipMapper, PeerAddr, ReplicationKey, ReplicationRecord,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredEntry {
    payload: Bytes,
    checksum: String,
    version: HLCTimestamp,
}

impl StoredEntry {
    fn new(payload: Bytes, version: HLCTimestamp) -> Self {
        Self {
            checksum: payload_checksum(&payload),
            payload,
            version,
        }
    }

    fn digest(&self) -> Digest {
        Digest {
            checksum: self.checksum.clone(),
            version: self.version,
        }
    }
}

/// DashMap-based record store for one data type.
pub struct MemoryRecordStore {
    data_type: String,
    node: PeerAddr,
    entries: DashMap<String, StoredEntry>,
    tombstones: DashMap<String, HLCTimestamp>,
    clock: Mutex<HLCTimestamp>,
    ownership: Option<Arc<OwnershipMapper>>,
    listener: RwLock<Option<ChangeListener>>,
}

impl MemoryRecordStore {
    pub fn new(data_type: impl Into<String>, node: PeerAddr) -> Self {
        Self {
            data_type: data_type.into(),
            node,
            entries: DashMap::new(),
            tombstones: DashMap::new(),
            clock: Mutex::new(HLCTimestamp::default()),
            ownership: None,
            listener: RwLock::new(None),
        }
    }

    /// Restrict the verify summary to resources this node owns: those whose
    /// current version it wrote, plus those whose writer is not `Up`.
    pub fn with_ownership(mut self, ownership: Arc<OwnershipMapper>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    /// Install the callback fired on every local write.
    pub fn set_listener(&self, listener: ChangeListener) {
        *self.listener.write() = Some(listener);
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    fn next_version(&self) -> HLCTimestamp {
        let mut clock = self.clock.lock();
        *clock = clock.tick(None, &self.node);
        *clock
    }

    fn observe(&self, version: &HLCTimestamp) {
        let mut clock = self.clock.lock();
        if *version > *clock {
            *clock = clock.tick(Some(version), &self.node);
        }
    }

    fn notify(&self, resource_id: &str, kind: ChangeKind) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(&ReplicationKey::new(self.data_type.clone(), resource_id), kind);
        }
    }

    fn key(&self, resource_id: &str) -> ReplicationKey {
        ReplicationKey::new(self.data_type.clone(), resource_id)
    }

    /// Local write. Returns the version assigned to it.
    pub fn put(&self, resource_id: &str, payload: Bytes) -> HLCTimestamp {
        let version = self.next_version();
        let kind = match self.entries.insert(resource_id.to_string(), StoredEntry::new(payload, version)) {
            Some(_) => ChangeKind::Change,
            None => ChangeKind::Add,
        };
        self.tombstones.remove(resource_id);
        self.notify(resource_id, kind);
        version
    }

    /// Local delete. Returns whether the resource existed.
    pub fn remove(&self, resource_id: &str) -> bool {
        let version = self.next_version();
        let existed = self.entries.remove(resource_id).is_some();
        if existed {
            self.tombstones.insert(resource_id.to_string(), version);
            self.notify(resource_id, ChangeKind::Delete);
        }
        existed
    }

    pub fn get(&self, resource_id: &str) -> Option<Bytes> {
        self.entries.get(resource_id).map(|e| e.payload.clone())
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.entries.contains_key(resource_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resource ids held locally, sorted.
    pub fn resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn apply_data(&self, record: &ReplicationRecord) -> bool {
        let resource_id = &record.key.resource_id;
        let deleted_at = self.tombstones.get(resource_id).map(|t| *t);
        if matches!(deleted_at, Some(t) if record.version <= t) {
            return false;
        }

        let applied = match self.entries.entry(resource_id.clone()) {
            Entry::Occupied(mut local) => {
                if record.version > local.get().version {
                    local.insert(StoredEntry::new(record.payload.clone(), record.version));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredEntry::new(record.payload.clone(), record.version));
                true
            }
        };
        if applied && deleted_at.is_some() {
            self.tombstones.remove(resource_id);
        }
        applied
    }

    fn apply_delete(&self, record: &ReplicationRecord) -> bool {
        let resource_id = &record.key.resource_id;
        let removed = match self.entries.entry(resource_id.clone()) {
            Entry::Occupied(local) if local.get().version > record.version => return false,
            Entry::Occupied(local) => {
                local.remove();
                true
            }
            Entry::Vacant(_) => false,
        };

        self.tombstones
            .entry(resource_id.clone())
            .and_modify(|t| {
                if record.version > *t {
                    *t = record.version;
                }
            })
            .or_insert(record.version);
        removed
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_record(&self, resource_id: &str) -> Result<ReplicationRecord> {
        let entry = self
            .entries
            .get(resource_id)
            .ok_or_else(|| DistroError::not_found(&self.data_type, resource_id))?;
        Ok(ReplicationRecord::data(
            self.key(resource_id),
            ChangeKind::Change,
            entry.payload.clone(),
            entry.version,
        ))
    }

    async fn get_verify_summary(&self) -> Option<ReplicationRecord> {
        let summary: ChecksumSummary = self
            .entries
            .iter()
            .filter(|e| {
                self.ownership
                    .as_ref()
                    .map_or(true, |o| o.is_responsible(&e.value().version))
            })
            .map(|e| (e.key().clone(), e.value().digest()))
            .collect();

        if summary.is_empty() {
            return None;
        }
        Some(ReplicationRecord::verify(self.data_type.clone(), summary))
    }

    async fn snapshot(&self) -> Vec<ReplicationRecord> {
        self.entries
            .iter()
            .map(|e| {
                ReplicationRecord::data(
                    self.key(e.key()),
                    ChangeKind::Snapshot,
                    e.value().payload.clone(),
                    e.value().version,
                )
            })
            .collect()
    }

    async fn apply(&self, record: &ReplicationRecord) -> Result<bool> {
        if record.kind == ChangeKind::Verify {
            return Err(DistroError::InvalidRecord("cannot apply a verify summary".to_string()));
        }
        if record.key.data_type != self.data_type {
            return Err(DistroError::InvalidRecord(format!(
                "record for {} applied to {} store",
                record.key.data_type, self.data_type
            )));
        }
        if !record.is_well_formed() {
            return Err(DistroError::InvalidRecord(format!(
                "{} record for {} failed checksum",
                record.kind, record.key
            )));
        }

        self.observe(&record.version);
        let changed = match record.kind {
            ChangeKind::Delete => self.apply_delete(record),
            _ => self.apply_data(record),
        };
        Ok(changed)
    }

    async fn apply_snapshot(&self, records: Vec<ReplicationRecord>) -> Result<usize> {
        let mut applied = 0;
        for record in &records {
            match self.apply(record).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(key = %record.key, "skipping snapshot entry: {}", e),
            }
        }
        Ok(applied)
    }

    async fn digest(&self, resource_id: &str) -> Option<Digest> {
        self.entries.get(resource_id).map(|e| e.digest())
    }

    async fn tombstone(&self, resource_id: &str) -> Option<HLCTimestamp> {
        self.tombstones.get(resource_id).map(|t| *t)
    }
}
