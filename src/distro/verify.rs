//! Verify Task
//!
//! Anti-entropy. On every `verify_interval` each domain's checksum summary
//! is sent to every peer; the receiving side compares it with its own state
//! and pulls what is missing or stale. This heals whatever the change-driven
//! path missed: dropped syncs, restarts, partitions.

use crate::distro::component::ComponentRegistry;
use crate::distro::config::SharedDistroConfig;
use crate::distro::ports::{MemberDirectory, RecordStore};
use crate::distro::types::{ChangeKind, Digest, HLCTimestamp, ReplicationRecord};
use crate::infrastructure::ShutdownController;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Outcome of one verify round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyRound {
    /// Domains that own nothing yet
    pub skipped: usize,
    /// Summaries delivered
    pub sent: usize,
    /// Summaries that failed to reach a peer
    pub failed: usize,
}

pub struct VerifyTask {
    components: Arc<ComponentRegistry>,
    members: Arc<dyn MemberDirectory>,
}

impl VerifyTask {
    pub fn new(components: Arc<ComponentRegistry>, members: Arc<dyn MemberDirectory>) -> Self {
        Self { components, members }
    }

    /// Broadcast every domain's summary once.
    pub async fn run_once(&self) -> VerifyRound {
        let mut round = VerifyRound::default();
        let peers = self.members.members_excluding_self();

        for data_type in self.components.data_types() {
            let Ok(component) = self.components.lookup(&data_type) else {
                continue;
            };

            let summary = match component.record_store.get_verify_summary().await {
                Some(summary) if !summary.summary.is_empty() => summary,
                _ => {
                    tracing::debug!("{} owns nothing yet, skipping verify", data_type);
                    round.skipped += 1;
                    continue;
                }
            };

            let transport = component.transport.clone();
            let sends = peers.iter().map(|member| {
                let transport = transport.clone();
                let summary = summary.clone();
                async move {
                    let result = transport.sync_verify_data(summary, &member.address).await;
                    (member, result)
                }
            });

            for (member, result) in join_all(sends).await {
                match result {
                    Ok(()) => round.sent += 1,
                    Err(e) => {
                        tracing::warn!("verify {} to {} failed: {}", data_type, member.address, e);
                        round.failed += 1;
                    }
                }
            }
        }

        tracing::debug!(?round, "verify round finished");
        round
    }

    /// Run rounds forever, re-reading the interval before each one.
    pub fn start(
        self: &Arc<Self>,
        config: SharedDistroConfig,
        shutdown: &ShutdownController,
    ) -> JoinHandle<()> {
        let task = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                if shutdown.is_shutdown() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(config.verify_interval()) => {
                        task.run_once().await;
                    }
                }
            }
            tracing::debug!("verify task stopped");
        })
    }
}

/// What the receiver of a summary does about one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyDecision {
    InSync,
    /// Fetch from the sender and apply with this kind
    Pull(ChangeKind),
    /// Local state is newer or the resource was deleted later
    KeepLocal,
}

/// Last-write-wins comparison of a remote digest against local state.
pub fn decide(remote: &Digest, local: Option<&Digest>, tombstone: Option<HLCTimestamp>) -> VerifyDecision {
    if let Some(deleted_at) = tombstone {
        if remote.version <= deleted_at {
            return VerifyDecision::KeepLocal;
        }
    }
    match local {
        None => VerifyDecision::Pull(ChangeKind::Add),
        Some(local) if local.checksum == remote.checksum => VerifyDecision::InSync,
        Some(local) if remote.version > local.version => VerifyDecision::Pull(ChangeKind::Change),
        Some(_) => VerifyDecision::KeepLocal,
    }
}

/// Resources of `summary` that must be pulled, with the kind to apply.
pub async fn plan_pulls(store: &dyn RecordStore, summary: &ReplicationRecord) -> Vec<(String, ChangeKind)> {
    let mut pulls = Vec::new();
    for (resource_id, remote) in &summary.summary {
        let local = store.digest(resource_id).await;
        let tombstone = store.tombstone(resource_id).await;
        if let VerifyDecision::Pull(kind) = decide(remote, local.as_ref(), tombstone) {
            pulls.push((resource_id.clone(), kind));
        }
    }
    pulls
}
