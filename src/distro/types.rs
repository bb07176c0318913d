//! Distro Types
//!
//! Addressing and payload units of the replication core: peer addresses,
//! replication keys, records, change kinds and the hybrid logical clock used
//! for last-write-wins ordering.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::distro::error::DistroError;

/// Address of a cluster member (e.g., "10.0.0.5:4002").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddr(pub String);

impl PeerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hash stamped into the HLC versions this member writes.
    pub fn node_hash(&self) -> u32 {
        crc32fast::hash(self.0.as_bytes())
    }

    /// Resolve the address as a socket address for network transports.
    pub fn socket_addr(&self) -> Result<SocketAddr, DistroError> {
        self.0.parse().map_err(|e| DistroError::Transport {
            peer: self.0.clone(),
            message: format!("invalid peer address: {}", e),
        })
    }
}

impl From<String> for PeerAddr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hybrid Logical Clock timestamp for ordering writes.
///
/// Combines wall clock time with a logical counter to ensure
/// total ordering even when wall clocks are skewed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HLCTimestamp {
    /// Wall clock time in microseconds since UNIX epoch
    pub wall_time: u64,
    /// Logical counter for events at the same wall time
    pub counter: u32,
    /// Node address hash for tie-breaking
    pub node_hash: u32,
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

impl HLCTimestamp {
    /// Create a new timestamp for the current time.
    pub fn now(node: &PeerAddr) -> Self {
        Self {
            wall_time: wall_clock_micros(),
            counter: 0,
            node_hash: node.node_hash(),
        }
    }

    /// Whether `node` issued this version.
    pub fn written_by(&self, node: &PeerAddr) -> bool {
        self.node_hash == node.node_hash()
    }

    /// Create a timestamp that is greater than self and other.
    pub fn tick(&self, other: Option<&HLCTimestamp>, node: &PeerAddr) -> Self {
        let now = wall_clock_micros();
        let node_hash = node.node_hash();

        match other {
            Some(o) => {
                let max_wall = now.max(self.wall_time).max(o.wall_time);
                let counter = if max_wall == self.wall_time && max_wall == o.wall_time {
                    self.counter.max(o.counter) + 1
                } else if max_wall == self.wall_time {
                    self.counter + 1
                } else if max_wall == o.wall_time {
                    o.counter + 1
                } else {
                    0
                };
                Self {
                    wall_time: max_wall,
                    counter,
                    node_hash,
                }
            }
            None => {
                let max_wall = now.max(self.wall_time);
                let counter = if max_wall == self.wall_time {
                    self.counter + 1
                } else {
                    0
                };
                Self {
                    wall_time: max_wall,
                    counter,
                    node_hash,
                }
            }
        }
    }
}

/// Kind of change carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Resource created
    Add,
    /// Resource updated
    Change,
    /// Resource removed
    Delete,
    /// Full-state transfer entry during catch-up
    Snapshot,
    /// Checksum summary for anti-entropy
    Verify,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "ADD",
            ChangeKind::Change => "CHANGE",
            ChangeKind::Delete => "DELETE",
            ChangeKind::Snapshot => "SNAPSHOT",
            ChangeKind::Verify => "VERIFY",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies "this resource, destined for this peer".
///
/// Sync tasks carry a target peer; verify and local lookups leave it empty.
/// Used as the debounce unit and as the worker sharding key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationKey {
    pub target_peer: Option<PeerAddr>,
    pub data_type: String,
    pub resource_id: String,
}

impl ReplicationKey {
    /// Key for a resource with no target peer.
    pub fn new(data_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            target_peer: None,
            data_type: data_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Same resource, destined for `peer`.
    pub fn with_target(mut self, peer: PeerAddr) -> Self {
        self.target_peer = Some(peer);
        self
    }

    /// Same resource with the target stripped.
    pub fn local(&self) -> Self {
        Self {
            target_peer: None,
            data_type: self.data_type.clone(),
            resource_id: self.resource_id.clone(),
        }
    }

    /// Stable hash used to route the key to a worker.
    pub fn shard_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.data_type.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.resource_id.as_bytes());
        hasher.update(&[0]);
        if let Some(peer) = &self.target_peer {
            hasher.update(peer.0.as_bytes());
        }
        hasher.finalize()
    }
}

impl std::fmt::Display for ReplicationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target_peer {
            Some(peer) => write!(f, "{}:{}->{}", self.data_type, self.resource_id, peer),
            None => write!(f, "{}:{}", self.data_type, self.resource_id),
        }
    }
}

/// Checksum and version of one resource as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub checksum: String,
    pub version: HLCTimestamp,
}

/// resourceId -> digest for a whole data domain.
pub type ChecksumSummary = BTreeMap<String, Digest>;

/// CRC32 checksum of a payload, hex encoded.
pub fn payload_checksum(payload: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(payload))
}

/// One replicated resource (or a verify summary).
///
/// For `Verify` records the payload is empty and `summary` covers the whole
/// domain; for every other kind `summary` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub key: ReplicationKey,
    pub kind: ChangeKind,
    pub payload: Bytes,
    pub checksum: Option<String>,
    pub version: HLCTimestamp,
    pub summary: ChecksumSummary,
}

impl ReplicationRecord {
    /// A record carrying resource data.
    pub fn data(key: ReplicationKey, kind: ChangeKind, payload: Bytes, version: HLCTimestamp) -> Self {
        let checksum = Some(payload_checksum(&payload));
        Self {
            key,
            kind,
            payload,
            checksum,
            version,
            summary: ChecksumSummary::new(),
        }
    }

    /// A deletion marker; carries no payload.
    pub fn delete(key: ReplicationKey, version: HLCTimestamp) -> Self {
        Self {
            key,
            kind: ChangeKind::Delete,
            payload: Bytes::new(),
            checksum: None,
            version,
            summary: ChecksumSummary::new(),
        }
    }

    /// A checksum summary for a whole domain. The key carries only the data type.
    pub fn verify(data_type: impl Into<String>, summary: ChecksumSummary) -> Self {
        Self {
            key: ReplicationKey::new(data_type, ""),
            kind: ChangeKind::Verify,
            payload: Bytes::new(),
            checksum: None,
            version: HLCTimestamp::default(),
            summary,
        }
    }

    /// Digest of this record's payload, if it carries one.
    pub fn digest(&self) -> Option<Digest> {
        self.checksum.as_ref().map(|checksum| Digest {
            checksum: checksum.clone(),
            version: self.version,
        })
    }

    /// Check the payload/summary invariant for the record's kind.
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            ChangeKind::Verify => self.payload.is_empty(),
            ChangeKind::Delete => self.summary.is_empty(),
            ChangeKind::Add | ChangeKind::Change | ChangeKind::Snapshot => {
                self.summary.is_empty()
                    && self.checksum.as_deref() == Some(payload_checksum(&self.payload).as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_peer_addr() {
        let addr = PeerAddr::new("10.0.0.1:4002");
        assert_eq!(addr.as_str(), "10.0.0.1:4002");
        assert_eq!(format!("{}", addr), "10.0.0.1:4002");
        assert_eq!(addr.socket_addr().unwrap().port(), 4002);
    }

    #[test]
    fn test_peer_addr_invalid_socket_addr() {
        let addr = PeerAddr::new("not-an-address");
        assert!(matches!(addr.socket_addr(), Err(DistroError::Transport { .. })));
    }

    #[test]
    fn test_peer_addr_ordering() {
        let mut peers = vec![PeerAddr::new("b:1"), PeerAddr::new("a:1"), PeerAddr::new("c:1")];
        peers.sort();
        assert_eq!(peers[0].as_str(), "a:1");
        assert_eq!(peers[2].as_str(), "c:1");
    }

    #[test]
    fn test_hlc_timestamp_ordering() {
        let node = PeerAddr::new("node-1");
        let t1 = HLCTimestamp::now(&node);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = HLCTimestamp::now(&node);

        assert!(t2 > t1);
    }

    #[test]
    fn test_hlc_timestamp_tick() {
        let node = PeerAddr::new("node-1");
        let t1 = HLCTimestamp::now(&node);
        let t2 = t1.tick(None, &node);
        let t3 = t2.tick(Some(&t1), &node);

        assert!(t2 > t1);
        assert!(t3 > t2);
    }

    #[test]
    fn test_hlc_written_by() {
        let a = PeerAddr::new("node-1");
        let b = PeerAddr::new("node-2");
        let remote = HLCTimestamp::now(&b);

        // ticking past a remote version re-stamps it with the local node
        let local = HLCTimestamp::now(&a).tick(Some(&remote), &a);
        assert!(remote.written_by(&b));
        assert!(!remote.written_by(&a));
        assert!(local.written_by(&a));
    }

    #[test]
    fn test_hlc_tick_same_wall_time_both() {
        let node = PeerAddr::new("node-1");
        let wall = u64::MAX - 1000;
        let ts1 = HLCTimestamp { wall_time: wall, counter: 5, node_hash: 42 };
        let ts2 = HLCTimestamp { wall_time: wall, counter: 3, node_hash: 43 };

        let result = ts1.tick(Some(&ts2), &node);
        assert_eq!(result.counter, 6);
        assert_eq!(result.wall_time, wall);
    }

    #[test]
    fn test_hlc_tick_other_has_higher_wall_time() {
        let node = PeerAddr::new("node-1");
        let far_future = u64::MAX - 100;
        let self_ts = HLCTimestamp { wall_time: 1000, counter: 5, node_hash: 42 };
        let other_ts = HLCTimestamp { wall_time: far_future, counter: 10, node_hash: 43 };

        let result = self_ts.tick(Some(&other_ts), &node);

        assert_eq!(result.wall_time, far_future);
        assert_eq!(result.counter, 11);
    }

    #[test]
    fn test_key_equality_includes_target() {
        let k1 = ReplicationKey::new("instances", "svc-1");
        let k2 = ReplicationKey::new("instances", "svc-1").with_target(PeerAddr::new("b:1"));
        let k3 = ReplicationKey::new("instances", "svc-1").with_target(PeerAddr::new("c:1"));

        assert_ne!(k1, k2);
        assert_ne!(k2, k3);
        assert_eq!(k2.local(), k1);

        let mut set = HashSet::new();
        set.insert(k2.clone());
        assert!(set.contains(&k2));
        assert!(!set.contains(&k3));
    }

    #[test]
    fn test_key_shard_hash_is_stable() {
        let key = ReplicationKey::new("instances", "svc-1").with_target(PeerAddr::new("b:1"));
        assert_eq!(key.shard_hash(), key.clone().shard_hash());
        assert_ne!(key.shard_hash(), key.local().shard_hash());
    }

    #[test]
    fn test_key_display() {
        let key = ReplicationKey::new("instances", "svc-1");
        assert_eq!(key.to_string(), "instances:svc-1");
        let key = key.with_target(PeerAddr::new("b:1"));
        assert_eq!(key.to_string(), "instances:svc-1->b:1");
    }

    #[test]
    fn test_change_kind_display() {
        assert_eq!(ChangeKind::Add.to_string(), "ADD");
        assert_eq!(ChangeKind::Verify.to_string(), "VERIFY");
    }

    #[test]
    fn test_data_record_checksum() {
        let record = ReplicationRecord::data(
            ReplicationKey::new("instances", "svc-1"),
            ChangeKind::Add,
            Bytes::from_static(b"v1"),
            HLCTimestamp::default(),
        );

        assert_eq!(record.checksum, Some(payload_checksum(b"v1")));
        assert!(record.is_well_formed());
        assert_eq!(record.digest().unwrap().checksum, payload_checksum(b"v1"));
    }

    #[test]
    fn test_tampered_record_is_not_well_formed() {
        let mut record = ReplicationRecord::data(
            ReplicationKey::new("instances", "svc-1"),
            ChangeKind::Change,
            Bytes::from_static(b"v1"),
            HLCTimestamp::default(),
        );
        record.payload = Bytes::from_static(b"tampered");

        assert!(!record.is_well_formed());
    }

    #[test]
    fn test_verify_record_invariant() {
        let mut summary = ChecksumSummary::new();
        summary.insert(
            "svc-1".to_string(),
            Digest { checksum: payload_checksum(b"v1"), version: HLCTimestamp::default() },
        );
        let record = ReplicationRecord::verify("instances", summary);

        assert_eq!(record.kind, ChangeKind::Verify);
        assert!(record.payload.is_empty());
        assert_eq!(record.summary.len(), 1);
        assert_eq!(record.key.data_type, "instances");
        assert!(record.is_well_formed());
    }

    #[test]
    fn test_delete_record_has_no_payload() {
        let record = ReplicationRecord::delete(
            ReplicationKey::new("instances", "svc-1"),
            HLCTimestamp::default(),
        );
        assert!(record.payload.is_empty());
        assert!(record.digest().is_none());
        assert!(record.is_well_formed());
    }

    #[test]
    fn test_record_bincode_roundtrip() {
        let record = ReplicationRecord::data(
            ReplicationKey::new("instances", "svc-1").with_target(PeerAddr::new("b:1")),
            ChangeKind::Change,
            Bytes::from_static(b"payload"),
            HLCTimestamp { wall_time: 7, counter: 1, node_hash: 3 },
        );

        let bytes = bincode::serialize(&record).unwrap();
        let decoded: ReplicationRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, record);
    }
}
