//! Startup Snapshot Loader
//!
//! A joining node pulls a full snapshot of every domain from one of its
//! peers before it counts as initialized. A domain with no reachable peer
//! is retried on `load_data_retry_delay` until it loads or the node stops.

use crate::distro::component::ComponentRegistry;
use crate::distro::config::SharedDistroConfig;
use crate::distro::ports::MemberDirectory;
use crate::distro::types::ChangeKind;
use crate::infrastructure::ShutdownController;
use dashmap::DashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct SnapshotLoader {
    components: Arc<ComponentRegistry>,
    members: Arc<dyn MemberDirectory>,
    config: SharedDistroConfig,
    loaded: DashSet<String>,
}

impl SnapshotLoader {
    pub fn new(
        components: Arc<ComponentRegistry>,
        members: Arc<dyn MemberDirectory>,
        config: SharedDistroConfig,
    ) -> Self {
        Self {
            components,
            members,
            config,
            loaded: DashSet::new(),
        }
    }

    pub fn is_loaded(&self, data_type: &str) -> bool {
        self.loaded.contains(data_type)
    }

    /// True once every registered domain has loaded.
    pub fn all_loaded(&self) -> bool {
        self.components
            .data_types()
            .iter()
            .all(|data_type| self.is_loaded(data_type))
    }

    /// One pass over the `Up` peers for `data_type`. Returns whether it loaded.
    pub async fn load_once(&self, data_type: &str) -> bool {
        if self.is_loaded(data_type) {
            return true;
        }
        let component = match self.components.lookup(data_type) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("cannot load snapshot: {}", e);
                return false;
            }
        };

        let peers = self.members.up_members_excluding_self();
        if peers.is_empty() {
            tracing::info!("{}: no peers, starting with local state", data_type);
            self.loaded.insert(data_type.to_string());
            return true;
        }

        let timeout = self.config.get().load_data_timeout;
        for peer in peers {
            let fetched = tokio::time::timeout(
                timeout,
                component.transport.fetch_snapshot(data_type, &peer.address),
            )
            .await;

            let records = match fetched {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    tracing::warn!("{}: snapshot from {} failed: {}", data_type, peer.address, e);
                    continue;
                }
                Err(_) => {
                    tracing::warn!("{}: snapshot from {} timed out", data_type, peer.address);
                    continue;
                }
            };

            let total = records.len();
            let records = records
                .into_iter()
                .filter(|r| r.kind != ChangeKind::Verify)
                .map(|mut r| {
                    if r.kind != ChangeKind::Delete {
                        r.kind = ChangeKind::Snapshot;
                    }
                    r
                })
                .collect();

            match component.record_store.apply_snapshot(records).await {
                Ok(applied) => {
                    tracing::info!(
                        "{}: loaded snapshot from {} ({} records, {} applied)",
                        data_type,
                        peer.address,
                        total,
                        applied
                    );
                    self.loaded.insert(data_type.to_string());
                    return true;
                }
                Err(e) => {
                    tracing::warn!("{}: applying snapshot from {} failed: {}", data_type, peer.address, e);
                }
            }
        }
        false
    }

    /// Load `data_type`, retrying until success or shutdown.
    pub async fn load(&self, data_type: &str, shutdown: &ShutdownController) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            if shutdown.is_shutdown() || self.load_once(data_type).await {
                return;
            }
            let delay = self.config.load_data_retry_delay();
            tracing::warn!("{}: snapshot load failed, retrying in {:?}", data_type, delay);
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Spawn one loader per registered domain.
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownController) -> Vec<JoinHandle<()>> {
        self.components
            .data_types()
            .into_iter()
            .map(|data_type| {
                let loader = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { loader.load(&data_type, &shutdown).await })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryRecordStore, StaticMemberDirectory};
    use crate::distro::config::DistroConfig;
    use crate::distro::ports::{DelayedRetryPolicy, MemberState, RecordStore};
    use crate::distro::testing::RecordingTransport;
    use crate::distro::types::PeerAddr;
    use bytes::Bytes;
    use std::time::Duration;

    struct Fixture {
        loader: Arc<SnapshotLoader>,
        store: Arc<MemoryRecordStore>,
        transport: Arc<RecordingTransport>,
        members: Arc<StaticMemberDirectory>,
    }

    fn fixture(peers: &[&str]) -> Fixture {
        let me = PeerAddr::new("a:1");
        let members = Arc::new(StaticMemberDirectory::new(
            me.clone(),
            peers.iter().map(|p| PeerAddr::new(*p)).collect(),
        ));
        let store = Arc::new(MemoryRecordStore::new("instances", me));
        let transport = Arc::new(RecordingTransport::default());
        let config = SharedDistroConfig::new(
            DistroConfig::new().load_data_retry_delay(Duration::from_millis(500)),
        )
        .unwrap();
        let components = Arc::new(ComponentRegistry::new());
        components
            .register(
                "instances",
                store.clone(),
                transport.clone(),
                Arc::new(DelayedRetryPolicy::new(config.clone())),
            )
            .unwrap();
        Fixture {
            loader: Arc::new(SnapshotLoader::new(components, members.clone(), config)),
            store,
            transport,
            members,
        }
    }

    async fn seed(transport: &RecordingTransport) {
        let source = MemoryRecordStore::new("instances", PeerAddr::new("b:1"));
        source.put("svc-1", Bytes::from_static(b"v1"));
        source.put("svc-2", Bytes::from_static(b"v2"));
        transport.snapshots.lock().extend(source.snapshot().await);
    }

    #[tokio::test]
    async fn test_single_node_loads_immediately() {
        let f = fixture(&[]);
        assert!(!f.loader.all_loaded());
        assert!(f.loader.load_once("instances").await);
        assert!(f.loader.all_loaded());
    }

    #[tokio::test]
    async fn test_load_from_first_reachable_peer() {
        let f = fixture(&["b:1", "c:1"]);
        seed(&f.transport).await;
        f.transport.fail("b:1");

        assert!(f.loader.load_once("instances").await);
        assert!(f.loader.is_loaded("instances"));
        assert_eq!(f.store.len(), 2);
    }

    #[tokio::test]
    async fn test_down_peers_are_not_asked() {
        let f = fixture(&["b:1"]);
        f.members.set_state(&PeerAddr::new("b:1"), MemberState::Down);

        assert!(f.loader.load_once("instances").await);
        assert_eq!(f.store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_a_peer_answers() {
        let f = fixture(&["b:1"]);
        seed(&f.transport).await;
        f.transport.fail("b:1");
        let shutdown = ShutdownController::new();

        let handles = f.loader.start(&shutdown);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!f.loader.all_loaded());

        f.transport.heal("b:1");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(f.loader.all_loaded());
        assert_eq!(f.store.len(), 2);

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_retrying() {
        let f = fixture(&["b:1"]);
        f.transport.fail("b:1");
        let shutdown = ShutdownController::new();

        let handles = f.loader.start(&shutdown);
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.shutdown();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!f.loader.all_loaded());
    }
}
