//! Adapters
//!
//! Implementations of the replication ports: record storage, membership and
//! transport.

pub mod gossip_members;
pub mod loopback;
pub mod memory_record_store;
pub mod quic_transport;
pub mod static_members;

pub use gossip_members::{GossipConfig, GossipMemberDirectory};
pub use loopback::{LoopbackNetwork, LoopbackTransport, SentRecord};
pub use memory_record_store::MemoryRecordStore;
pub use quic_transport::{QuicTransportAgent, WireMessage};
pub use static_members::StaticMemberDirectory;
