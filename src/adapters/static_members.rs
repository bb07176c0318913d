//! Static Member Directory
//!
//! Fixed member list with explicit state setters. Used for statically
//! configured clusters and in tests.

use crate::distro::ports::{Member, MemberDirectory, MemberState};
use crate::distro::PeerAddr;
use parking_lot::RwLock;

pub struct StaticMemberDirectory {
    self_addr: PeerAddr,
    members: RwLock<Vec<Member>>,
}

impl StaticMemberDirectory {
    /// All `peers` start `Up`. Self may or may not be listed.
    pub fn new(self_addr: PeerAddr, peers: Vec<PeerAddr>) -> Self {
        Self {
            self_addr,
            members: RwLock::new(peers.into_iter().map(Member::up).collect()),
        }
    }

    /// Add a member, or update its state if already present.
    pub fn upsert(&self, address: PeerAddr, state: MemberState) {
        let mut members = self.members.write();
        match members.iter_mut().find(|m| m.address == address) {
            Some(member) => member.state = state,
            None => members.push(Member::new(address, state)),
        }
    }

    /// Change a member's state. Returns false if it is unknown.
    pub fn set_state(&self, address: &PeerAddr, state: MemberState) -> bool {
        let mut members = self.members.write();
        match members.iter_mut().find(|m| &m.address == address) {
            Some(member) => {
                if member.state != state {
                    tracing::info!("member {} is now {:?}", address, state);
                }
                member.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, address: &PeerAddr) -> bool {
        let mut members = self.members.write();
        let before = members.len();
        members.retain(|m| &m.address != address);
        members.len() != before
    }
}

impl MemberDirectory for StaticMemberDirectory {
    fn self_address(&self) -> PeerAddr {
        self.self_addr.clone()
    }

    fn members(&self) -> Vec<Member> {
        self.members.read().clone()
    }
}
