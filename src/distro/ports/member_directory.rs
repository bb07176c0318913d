//! Member Directory Port
//!
//! Current cluster membership as seen by this node.

use crate::distro::types::PeerAddr;

/// Health of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// Reachable; a replication target
    Up,
    /// Missed recent heartbeats
    Suspicious,
    /// Declared failed
    Down,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub address: PeerAddr,
    pub state: MemberState,
}

impl Member {
    pub fn new(address: impl Into<PeerAddr>, state: MemberState) -> Self {
        Self {
            address: address.into(),
            state,
        }
    }

    pub fn up(address: impl Into<PeerAddr>) -> Self {
        Self::new(address, MemberState::Up)
    }

    pub fn is_up(&self) -> bool {
        self.state == MemberState::Up
    }
}

/// Source of cluster membership.
///
/// Every call returns a snapshot that may be stale by the time it is used;
/// the next verify cycle corrects whatever it misses.
pub trait MemberDirectory: Send + Sync {
    /// Address this node advertises to its peers.
    fn self_address(&self) -> PeerAddr;

    /// All known members, possibly including self.
    fn members(&self) -> Vec<Member>;

    /// All known members other than self.
    fn members_excluding_self(&self) -> Vec<Member> {
        let me = self.self_address();
        self.members()
            .into_iter()
            .filter(|m| m.address != me)
            .collect()
    }

    /// Replication targets: `Up` members other than self.
    fn up_members_excluding_self(&self) -> Vec<Member> {
        self.members_excluding_self()
            .into_iter()
            .filter(Member::is_up)
            .collect()
    }
}
