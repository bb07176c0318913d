//! Loopback Transport
//!
//! In-process TransportAgent: delivers directly to other `DistroProtocol`
//! instances registered on the same `LoopbackNetwork`. Supports per-peer
//! failure injection and keeps a log of every call, which is what the
//! multi-node tests assert on.

use crate::distro::error::{DistroError, Result};
use crate::distro::ports::TransportAgent;
use crate::distro::{DistroProtocol, PeerAddr, ReplicationKey, ReplicationRecord};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A record pushed over the network.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub from: PeerAddr,
    pub to: PeerAddr,
    pub record: ReplicationRecord,
    /// Whether the target accepted it. An accepted record may still have
    /// been ignored as older than what the target holds.
    pub delivered: bool,
}

/// Shared in-process network.
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: DashMap<PeerAddr, Weak<DistroProtocol>>,
    unreachable: DashSet<PeerAddr>,
    sent: Mutex<Vec<SentRecord>>,
    verify_calls: AtomicU64,
    fetch_calls: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `node` reachable at its own address.
    pub fn attach(&self, node: &Arc<DistroProtocol>) {
        self.nodes
            .insert(node.self_address().clone(), Arc::downgrade(node));
    }

    pub fn detach(&self, addr: &PeerAddr) {
        self.nodes.remove(addr);
    }

    /// Transport for the node at `from`.
    pub fn transport(self: &Arc<Self>, from: PeerAddr) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            from,
        }
    }

    /// Every call to `addr` fails until `heal`.
    pub fn partition(&self, addr: &PeerAddr) {
        self.unreachable.insert(addr.clone());
    }

    pub fn heal(&self, addr: &PeerAddr) {
        self.unreachable.remove(addr);
    }

    pub fn is_reachable(&self, addr: &PeerAddr) -> bool {
        !self.unreachable.contains(addr)
    }

    fn node(&self, addr: &PeerAddr) -> Result<Arc<DistroProtocol>> {
        if !self.is_reachable(addr) {
            return Err(DistroError::transport(addr, "unreachable"));
        }
        self.nodes
            .get(addr)
            .and_then(|n| n.upgrade())
            .ok_or_else(|| DistroError::transport(addr, "no such node"))
    }

    /// All records pushed so far, in send order.
    pub fn sent_records(&self) -> Vec<SentRecord> {
        self.sent.lock().clone()
    }

    /// Records pushed to `to` for `resource_id`.
    pub fn sent_to(&self, to: &PeerAddr, resource_id: &str) -> Vec<SentRecord> {
        self.sent
            .lock()
            .iter()
            .filter(|s| &s.to == to && s.record.key.resource_id == resource_id)
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.sent.lock().clear();
    }

    pub fn verify_calls(&self) -> u64 {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

/// One node's view of the loopback network.
#[derive(Clone)]
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    from: PeerAddr,
}

#[async_trait]
impl TransportAgent for LoopbackTransport {
    async fn sync_data(&self, record: ReplicationRecord, peer: &PeerAddr) -> Result<bool> {
        let mut sent = SentRecord {
            from: self.from.clone(),
            to: peer.clone(),
            record: record.clone(),
            delivered: false,
        };

        let outcome = match self.network.node(peer) {
            Ok(node) => node.on_receive_record(record).await.map(|_| true),
            Err(e) => Err(e),
        };
        sent.delivered = outcome.is_ok();
        self.network.sent.lock().push(sent);

        match outcome {
            Ok(delivered) => Ok(delivered),
            Err(DistroError::Transport { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn sync_verify_data(&self, summary: ReplicationRecord, peer: &PeerAddr) -> Result<()> {
        self.network.verify_calls.fetch_add(1, Ordering::SeqCst);
        let node = self.network.node(peer)?;
        node.on_receive_verify(summary, &self.from).await?;
        Ok(())
    }

    async fn fetch(&self, key: &ReplicationKey, peer: &PeerAddr) -> Result<ReplicationRecord> {
        self.network.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let node = self.network.node(peer)?;
        node.on_query(key).await
    }

    async fn fetch_snapshot(&self, data_type: &str, peer: &PeerAddr) -> Result<Vec<ReplicationRecord>> {
        let node = self.network.node(peer)?;
        node.on_snapshot(data_type).await
    }
}
