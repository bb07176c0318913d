//! Integration tests for Gossip membership
//!
//! Tests real UDP gossip between member directories using ephemeral ports.

use distro_replication::adapters::gossip_members::{create_join, GossipMessage};
use distro_replication::adapters::{GossipConfig, GossipMemberDirectory};
use distro_replication::distro::ports::{MemberDirectory, MemberState};
use distro_replication::distro::PeerAddr;
use distro_replication::infrastructure::ShutdownController;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

fn config(self_addr: &str, bootstrap: Vec<std::net::SocketAddr>) -> GossipConfig {
    GossipConfig::new(PeerAddr::new(self_addr), "127.0.0.1:0".parse().unwrap())
        .bootstrap_peers(bootstrap)
        .gossip_interval(Duration::from_millis(50))
        .timeouts(Duration::from_millis(300), Duration::from_millis(600))
}

async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn state_of(dir: &GossipMemberDirectory, addr: &str) -> Option<MemberState> {
    dir.members()
        .into_iter()
        .find(|m| m.address == PeerAddr::new(addr))
        .map(|m| m.state)
}

/// Join message arrives intact over UDP
#[tokio::test]
async fn test_gossip_join_message_over_udp() {
    let dir = GossipMemberDirectory::bind(config("127.0.0.1:7101", vec![])).await.unwrap();
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let join = GossipMessage::Join {
        sender: PeerAddr::new("127.0.0.1:7101"),
        gossip_addr: dir.gossip_addr(),
    };
    let data = bincode::serialize(&join).unwrap();
    sender.send_to(&data, receiver.local_addr().unwrap()).await.unwrap();

    let mut buf = vec![0u8; 65535];
    let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
    let received: GossipMessage = bincode::deserialize(&buf[..len]).unwrap();
    assert_eq!(received, join);
}

/// Two directories discover each other through a bootstrap join
#[tokio::test]
async fn test_two_nodes_discover_each_other() {
    let shutdown = ShutdownController::new();

    let first = Arc::new(GossipMemberDirectory::bind(config("127.0.0.1:7201", vec![])).await.unwrap());
    let second = Arc::new(
        GossipMemberDirectory::bind(config("127.0.0.1:7202", vec![first.gossip_addr()]))
            .await
            .unwrap(),
    );
    first.start(&shutdown);
    second.start(&shutdown);

    assert!(wait_until(|| state_of(&first, "127.0.0.1:7202") == Some(MemberState::Up)).await);
    assert!(wait_until(|| state_of(&second, "127.0.0.1:7201") == Some(MemberState::Up)).await);
    assert_eq!(first.up_members_excluding_self().len(), 1);

    shutdown.shutdown();
}

/// A member that stops answering is demoted
#[tokio::test]
async fn test_silent_member_goes_down() {
    let node_shutdown = ShutdownController::new();
    let peer_shutdown = ShutdownController::new();

    let node = Arc::new(GossipMemberDirectory::bind(config("127.0.0.1:7301", vec![])).await.unwrap());
    let peer = Arc::new(
        GossipMemberDirectory::bind(config("127.0.0.1:7302", vec![node.gossip_addr()]))
            .await
            .unwrap(),
    );
    let mut events = node.take_event_rx().unwrap();
    node.start(&node_shutdown);
    peer.start(&peer_shutdown);

    assert!(wait_until(|| state_of(&node, "127.0.0.1:7302") == Some(MemberState::Up)).await);

    peer_shutdown.shutdown();
    assert!(wait_until(|| state_of(&node, "127.0.0.1:7302") == Some(MemberState::Down)).await);
    assert!(node.up_members_excluding_self().is_empty());
    assert_eq!(node.members_excluding_self().len(), 1);

    // Joined, then at least one demotion
    let mut seen = 0;
    while events.try_recv().is_ok() {
        seen += 1;
    }
    assert!(seen >= 2);

    node_shutdown.shutdown();
}

/// Raw join from an unknown socket gets a member list back
#[tokio::test]
async fn test_join_is_answered_with_member_list() {
    let shutdown = ShutdownController::new();
    let node = Arc::new(GossipMemberDirectory::bind(config("127.0.0.1:7401", vec![])).await.unwrap());
    node.start(&shutdown);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = distro_replication::adapters::gossip_members::LocalNode {
        address: PeerAddr::new("127.0.0.1:7402"),
        gossip_addr: socket.local_addr().unwrap(),
    };
    let data = bincode::serialize(&create_join(&local)).unwrap();
    socket.send_to(&data, node.gossip_addr()).await.unwrap();

    let mut buf = vec![0u8; 65535];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    match bincode::deserialize::<GossipMessage>(&buf[..len]).unwrap() {
        GossipMessage::MemberList { members } => {
            assert!(members.iter().any(|(a, _)| a == &PeerAddr::new("127.0.0.1:7401")));
        }
        other => panic!("expected member list, got {:?}", other),
    }

    shutdown.shutdown();
}
