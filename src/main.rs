//! distro-node - Availability-first replication node
//!
//! This is the composition root that wires together all the components.

use bytes::Bytes;
use distro_replication::adapters::{GossipConfig, GossipMemberDirectory, MemoryRecordStore, QuicTransportAgent};
use distro_replication::config::load_config;
use distro_replication::distro::ports::MemberDirectory;
use distro_replication::distro::{DistroProtocol, OwnershipMapper, PeerAddr, SharedDistroConfig};
use distro_replication::infrastructure::{shutdown_signal, ShutdownController};
use distro_replication::naming::{Service, ServiceRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::fmt::format::FmtSpan;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let self_addr = PeerAddr::new(cfg.advertised_addr());
    tracing::info!(
        "starting distro node {} gossip={} transport={}",
        self_addr,
        cfg.gossip_addr,
        cfg.transport_addr
    );

    // ===== COMPOSITION ROOT =====
    let shared = SharedDistroConfig::new(cfg.distro_config()?)?;
    let adapters_shutdown = ShutdownController::new();

    // 1. Membership (gossip)
    let bootstrap: Vec<SocketAddr> = cfg
        .bootstrap_peers
        .iter()
        .filter_map(|p| match p.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!("ignoring bootstrap peer {}: {}", p, e);
                None
            }
        })
        .collect();
    let gossip_config = GossipConfig::new(self_addr.clone(), cfg.gossip_addr.parse()?).bootstrap_peers(bootstrap);
    let members = Arc::new(GossipMemberDirectory::bind(gossip_config).await?);
    let directory: Arc<dyn MemberDirectory> = members.clone();

    // 2. Transport (QUIC)
    let transport = Arc::new(QuicTransportAgent::bind(cfg.transport_addr.parse()?)?.advertise(self_addr.clone()));

    // 3. Replication engine and one store per data domain
    let protocol = Arc::new(DistroProtocol::new(shared, directory.clone()));
    let ownership = Arc::new(OwnershipMapper::new(directory));

    let mut stores = Vec::new();
    for data_type in &cfg.data_types {
        let store = Arc::new(MemoryRecordStore::new(data_type.as_str(), self_addr.clone()).with_ownership(ownership.clone()));
        protocol.register_default(data_type.as_str(), store.clone(), transport.clone())?;
        store.set_listener(protocol.change_listener());
        stores.push(store);
    }

    // 4. Start everything
    let mut handles = vec![
        members.start(&adapters_shutdown),
        transport.serve(Arc::downgrade(&protocol), &adapters_shutdown),
    ];
    protocol.start();

    // Announce this node as an instance of its own service
    let services = ServiceRegistry::new();
    let service = services.get_singleton(Service::named("distro-node"));
    if let Some(store) = stores.first() {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let instance = serde_json::json!({
            "service": service.grouped_name(),
            "address": self_addr.as_str(),
            "started_at": started_at,
        });
        store.put(
            &format!("{}#{}", service.grouped_name(), self_addr),
            Bytes::from(serde_json::to_vec(&instance)?),
        );
    }

    shutdown_signal(adapters_shutdown.clone()).await;

    protocol.shutdown(DRAIN_TIMEOUT).await;
    transport.close();
    for handle in handles.drain(..) {
        let _ = handle.await;
    }

    tracing::info!("distro node {} stopped", self_addr);
    Ok(())
}
