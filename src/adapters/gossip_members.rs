//! Gossip Member Directory (SWIM-like)
//!
//! Cluster membership and failure detection over UDP. Members are keyed by
//! the transport address replication targets; the gossip address is only
//! used for heartbeats.
//!
//! Uses Sans-IO pattern: message processing is separated from I/O for testability.

use crate::distro::ports::{Member, MemberDirectory, MemberState};
use crate::distro::PeerAddr;
use crate::infrastructure::ShutdownController;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Gossip tunables.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Transport address advertised to peers
    pub self_addr: PeerAddr,
    /// UDP bind address for heartbeats
    pub bind_addr: SocketAddr,
    /// Gossip addresses to join through
    pub bootstrap_peers: Vec<SocketAddr>,
    /// Ping period (default: 1s)
    pub gossip_interval: Duration,
    /// Silence before a member becomes Suspicious (default: 5s)
    pub suspect_timeout: Duration,
    /// Silence before a member becomes Down (default: 15s)
    pub down_timeout: Duration,
}

impl GossipConfig {
    pub fn new(self_addr: PeerAddr, bind_addr: SocketAddr) -> Self {
        Self {
            self_addr,
            bind_addr,
            bootstrap_peers: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            suspect_timeout: Duration::from_secs(5),
            down_timeout: Duration::from_secs(15),
        }
    }

    pub fn bootstrap_peers(mut self, peers: Vec<SocketAddr>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn timeouts(mut self, suspect: Duration, down: Duration) -> Self {
        self.suspect_timeout = suspect;
        self.down_timeout = down;
        self
    }
}

/// A member as tracked by gossip.
#[derive(Debug, Clone)]
pub struct GossipMember {
    pub address: PeerAddr,
    pub gossip_addr: SocketAddr,
    pub state: MemberState,
    pub last_seen: Instant,
}

/// Message types for gossip protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GossipMessage {
    /// Liveness probe
    Ping { sender: PeerAddr, gossip_addr: SocketAddr },
    /// Response to ping
    Ack { sender: PeerAddr, gossip_addr: SocketAddr },
    /// Announce joining the cluster
    Join { sender: PeerAddr, gossip_addr: SocketAddr },
    /// Known members as (transport address, gossip address)
    MemberList { members: Vec<(PeerAddr, SocketAddr)> },
}

/// Membership changes.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipEvent {
    MemberJoined(PeerAddr),
    StateChanged {
        address: PeerAddr,
        from: MemberState,
        to: MemberState,
    },
}

/// Output action from message processing (Sans-IO pattern).
#[derive(Debug, Clone, PartialEq)]
pub enum GossipAction {
    Send { to: SocketAddr, message: GossipMessage },
    Emit(GossipEvent),
}

/// Identity of the local node in gossip messages.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub address: PeerAddr,
    pub gossip_addr: SocketAddr,
}

type MemberTable = RwLock<HashMap<PeerAddr, GossipMember>>;

/// Record that `address` was heard from. Returns the resulting events.
fn mark_alive(
    members: &MemberTable,
    address: &PeerAddr,
    gossip_addr: SocketAddr,
    now: Instant,
) -> Vec<GossipAction> {
    let mut guard = members.write();
    match guard.get_mut(address) {
        Some(member) => {
            member.last_seen = now;
            member.gossip_addr = gossip_addr;
            if member.state != MemberState::Up {
                let from = member.state;
                member.state = MemberState::Up;
                return vec![GossipAction::Emit(GossipEvent::StateChanged {
                    address: address.clone(),
                    from,
                    to: MemberState::Up,
                })];
            }
            Vec::new()
        }
        None => {
            guard.insert(
                address.clone(),
                GossipMember {
                    address: address.clone(),
                    gossip_addr,
                    state: MemberState::Up,
                    last_seen: now,
                },
            );
            vec![GossipAction::Emit(GossipEvent::MemberJoined(address.clone()))]
        }
    }
}

/// Pure function to process a gossip message (Sans-IO pattern).
pub fn process_message(
    msg: &GossipMessage,
    src: SocketAddr,
    members: &MemberTable,
    local: &LocalNode,
    now: Instant,
) -> Vec<GossipAction> {
    match msg {
        GossipMessage::Ping {
            sender,
            gossip_addr,
        } => {
            let mut actions = vec![GossipAction::Send {
                to: src,
                message: GossipMessage::Ack {
                    sender: local.address.clone(),
                    gossip_addr: local.gossip_addr,
                },
            }];
            actions.extend(mark_alive(members, sender, *gossip_addr, now));
            actions
        }

        GossipMessage::Ack {
            sender,
            gossip_addr,
        } => mark_alive(members, sender, *gossip_addr, now),

        GossipMessage::Join {
            sender,
            gossip_addr,
        } => {
            let mut actions = mark_alive(members, sender, *gossip_addr, now);

            let mut list: Vec<(PeerAddr, SocketAddr)> = members
                .read()
                .values()
                .filter(|m| m.state != MemberState::Down)
                .map(|m| (m.address.clone(), m.gossip_addr))
                .collect();
            list.push((local.address.clone(), local.gossip_addr));

            actions.insert(
                0,
                GossipAction::Send {
                    to: src,
                    message: GossipMessage::MemberList { members: list },
                },
            );
            actions
        }

        GossipMessage::MemberList { members: list } => {
            let mut actions = Vec::new();
            for (address, gossip_addr) in list {
                if address == &local.address || members.read().contains_key(address) {
                    continue;
                }
                actions.extend(mark_alive(members, address, *gossip_addr, now));
            }
            actions
        }
    }
}

/// Demote members that have been silent too long (Sans-IO pattern).
pub fn check_member_failures(
    members: &MemberTable,
    suspect_timeout: Duration,
    down_timeout: Duration,
    now: Instant,
) -> Vec<GossipAction> {
    let mut actions = Vec::new();
    let mut guard = members.write();

    for member in guard.values_mut() {
        let silent = now.saturating_duration_since(member.last_seen);
        let next = if silent > down_timeout {
            MemberState::Down
        } else if silent > suspect_timeout {
            MemberState::Suspicious
        } else {
            continue;
        };

        if member.state != next {
            actions.push(GossipAction::Emit(GossipEvent::StateChanged {
                address: member.address.clone(),
                from: member.state,
                to: next,
            }));
            member.state = next;
        }
    }
    actions
}

/// Select a random non-Down member to ping (Sans-IO pattern).
pub fn select_ping_target(members: &MemberTable) -> Option<SocketAddr> {
    let addrs: Vec<SocketAddr> = members
        .read()
        .values()
        .filter(|m| m.state != MemberState::Down)
        .map(|m| m.gossip_addr)
        .collect();

    if addrs.is_empty() {
        return None;
    }
    let idx = rand::random::<usize>() % addrs.len();
    Some(addrs[idx])
}

pub fn create_ping(local: &LocalNode) -> GossipMessage {
    GossipMessage::Ping {
        sender: local.address.clone(),
        gossip_addr: local.gossip_addr,
    }
}

pub fn create_join(local: &LocalNode) -> GossipMessage {
    GossipMessage::Join {
        sender: local.address.clone(),
        gossip_addr: local.gossip_addr,
    }
}

/// MemberDirectory backed by gossip.
pub struct GossipMemberDirectory {
    config: GossipConfig,
    local: LocalNode,
    socket: Arc<UdpSocket>,
    members: Arc<MemberTable>,
    event_tx: mpsc::Sender<GossipEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<GossipEvent>>>,
}

impl GossipMemberDirectory {
    /// Bind the gossip socket.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn bind(config: GossipConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local = LocalNode {
            address: config.self_addr.clone(),
            gossip_addr: socket.local_addr()?,
        };
        tracing::info!("gossip listening on {}", local.gossip_addr);

        let (event_tx, event_rx) = mpsc::channel(1024);
        Ok(Self {
            config,
            local,
            socket: Arc::new(socket),
            members: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Bound gossip address.
    pub fn gossip_addr(&self) -> SocketAddr {
        self.local.gossip_addr
    }

    /// Membership change events (can only be taken once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<GossipEvent>> {
        self.event_rx.lock().take()
    }

    /// Join through the bootstrap peers and run the gossip loop until shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownController) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let join = create_join(&this.local);
            for peer in &this.config.bootstrap_peers {
                this.send(*peer, &join).await;
                tracing::info!("sent join message to bootstrap peer {}", peer);
            }

            let mut buf = vec![0u8; 65535];
            let mut gossip_timer = tokio::time::interval(this.config.gossip_interval);

            loop {
                if shutdown.is_shutdown() {
                    break;
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => break,

                    result = this.socket.recv_from(&mut buf) => match result {
                        Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                            Ok(msg) => {
                                let actions = process_message(&msg, src, &this.members, &this.local, Instant::now());
                                this.execute(actions).await;
                            }
                            Err(e) => tracing::debug!("bad gossip message from {}: {}", src, e),
                        },
                        Err(e) => tracing::error!("gossip recv error: {:?}", e),
                    },

                    _ = gossip_timer.tick() => {
                        let actions = check_member_failures(
                            &this.members,
                            this.config.suspect_timeout,
                            this.config.down_timeout,
                            Instant::now(),
                        );
                        this.execute(actions).await;

                        if let Some(target) = select_ping_target(&this.members) {
                            this.send(target, &create_ping(&this.local)).await;
                        }
                    }
                }
            }
            tracing::info!("gossip service shutting down");
        })
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn send(&self, to: SocketAddr, message: &GossipMessage) {
        match bincode::serialize(message) {
            Ok(data) => {
                if let Err(e) = self.socket.send_to(&data, to).await {
                    tracing::debug!("gossip send to {} failed: {}", to, e);
                }
            }
            Err(e) => tracing::warn!("failed to encode gossip message: {}", e),
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn execute(&self, actions: Vec<GossipAction>) {
        for action in actions {
            match action {
                GossipAction::Send { to, message } => self.send(to, &message).await,
                GossipAction::Emit(event) => {
                    match &event {
                        GossipEvent::MemberJoined(address) => tracing::info!("member {} joined", address),
                        GossipEvent::StateChanged { address, from, to } => {
                            tracing::info!("member {} {:?} -> {:?}", address, from, to)
                        }
                    }
                    let _ = self.event_tx.try_send(event);
                }
            }
        }
    }
}

impl MemberDirectory for GossipMemberDirectory {
    fn self_address(&self) -> PeerAddr {
        self.local.address.clone()
    }

    fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .read()
            .values()
            .map(|m| Member::new(m.address.clone(), m.state))
            .collect();
        members.sort_by(|a, b| a.address.cmp(&b.address));
        members
    }
}
