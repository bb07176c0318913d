//! Ownership Mapper
//!
//! Decides which resources a node advertises in its verify summary. The
//! member that wrote the current version owns it while that member is `Up`.
//! A resource whose writer is unhealthy or unknown is orphaned, and every
//! node holding it advertises it until the writer returns.

use crate::distro::ports::MemberDirectory;
use crate::distro::types::{HLCTimestamp, PeerAddr};
use std::sync::Arc;

pub struct OwnershipMapper {
    members: Arc<dyn MemberDirectory>,
}

impl OwnershipMapper {
    pub fn new(members: Arc<dyn MemberDirectory>) -> Self {
        Self { members }
    }

    /// Healthy member that wrote `version`, self included. `None` when the
    /// writer is not `Up` or not known at all.
    pub fn owner(&self, version: &HLCTimestamp) -> Option<PeerAddr> {
        let me = self.members.self_address();
        if version.written_by(&me) {
            return Some(me);
        }
        self.members
            .up_members_excluding_self()
            .into_iter()
            .map(|m| m.address)
            .find(|addr| version.written_by(addr))
    }

    /// Whether this node should advertise a resource held at `version`.
    pub fn is_responsible(&self, version: &HLCTimestamp) -> bool {
        match self.owner(version) {
            Some(owner) => owner == self.members.self_address(),
            None => true,
        }
    }
}
