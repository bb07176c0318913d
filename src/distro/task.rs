//! Sync, Delete and Pull Tasks
//!
//! What a worker actually does with an [`ExecuteTask`]. Sync and Delete
//! push the resource's state at execution time to one peer and publish a
//! retry on failure; Pull fetches a resource named in a peer's verify
//! summary and applies it.
//!
//! A push never invents a version: a live record goes out as a change even
//! when a delete was scheduled, and a deletion carries the local tombstone.

use crate::distro::component::{ComponentRegistry, DistroComponent};
use crate::distro::error::DistroError;
use crate::distro::retry::{RetryEvent, RetryPublisher};
use crate::distro::types::{ChangeKind, PeerAddr, ReplicationKey, ReplicationRecord};
use crate::distro::worker::{ExecuteTask, TaskHandler};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

/// Executes tasks against the registered components.
pub struct TaskExecutor {
    components: Arc<ComponentRegistry>,
    retry: RetryPublisher,
    self_addr: PeerAddr,
}

impl TaskExecutor {
    pub fn new(components: Arc<ComponentRegistry>, retry: RetryPublisher, self_addr: PeerAddr) -> Self {
        Self {
            components,
            retry,
            self_addr,
        }
    }

    fn component(&self, key: &ReplicationKey) -> Option<DistroComponent> {
        match self.components.lookup(&key.data_type) {
            Ok(component) => Some(component),
            Err(e) => {
                tracing::error!(key = %key, "dropping task: {}", e);
                None
            }
        }
    }

    /// What the peer should hold for `key` right now: the live record, or a
    /// deletion versioned by the local tombstone. `None` when the store knows
    /// neither, so there is nothing to send.
    async fn current_state(
        &self,
        component: &DistroComponent,
        key: &ReplicationKey,
    ) -> Result<Option<ReplicationRecord>, DistroError> {
        match component.record_store.get_record(&key.resource_id).await {
            Ok(mut record) => {
                record.key = key.local();
                record.kind = ChangeKind::Change;
                Ok(Some(record))
            }
            Err(DistroError::RecordNotFound { .. }) => Ok(component
                .record_store
                .tombstone(&key.resource_id)
                .await
                .map(|version| ReplicationRecord::delete(key.local(), version))),
            Err(e) => Err(e),
        }
    }

    async fn sync(&self, key: ReplicationKey, kind: ChangeKind, attempt: u32, created: Instant) {
        let Some(component) = self.component(&key) else {
            return;
        };

        let record = match self.current_state(&component, &key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(key = %key, "no record or tombstone, nothing to sync");
                return;
            }
            Err(e) => {
                tracing::warn!(key = %key, "failed to read record: {}", e);
                self.retry(key, kind, attempt, created);
                return;
            }
        };
        if record.kind != kind {
            // rewritten or deleted between scheduling and execution
            tracing::debug!(key = %key, scheduled = %kind, sending = %record.kind, "state changed since scheduling");
        }

        self.push(&component, key, record, attempt, created).await;
    }

    async fn push(
        &self,
        component: &DistroComponent,
        key: ReplicationKey,
        record: ReplicationRecord,
        attempt: u32,
        created: Instant,
    ) {
        let Some(peer) = key.target_peer.clone() else {
            tracing::warn!(key = %key, "sync task without target peer");
            return;
        };
        if peer == self.self_addr {
            tracing::debug!(key = %key, "skipping sync to self");
            return;
        }
        let kind = record.kind;

        match component.transport.sync_data(record, &peer).await {
            Ok(true) => {
                tracing::debug!(key = %key, kind = %kind, "synced to {}", peer);
            }
            Ok(false) => {
                tracing::warn!(key = %key, kind = %kind, "peer {} rejected sync", peer);
                self.retry(key, kind, attempt, created);
            }
            Err(e) => {
                tracing::warn!(key = %key, kind = %kind, "sync to {} failed: {}", peer, e);
                self.retry(key, kind, attempt, created);
            }
        }
    }

    fn retry(&self, key: ReplicationKey, kind: ChangeKind, attempt: u32, created: Instant) {
        self.retry
            .publish(RetryEvent::new(key, kind, attempt + 1).created_at(created));
    }

    async fn pull(&self, key: ReplicationKey, kind: ChangeKind) {
        let Some(component) = self.component(&key) else {
            return;
        };
        let Some(peer) = key.target_peer.clone() else {
            tracing::warn!(key = %key, "pull task without source peer");
            return;
        };

        let mut record = match component.transport.fetch(&key.local(), &peer).await {
            Ok(record) => record,
            Err(e) => {
                // the next verify round asks again
                tracing::warn!(key = %key, "pull from {} failed: {}", peer, e);
                return;
            }
        };
        if record.kind != ChangeKind::Delete {
            record.kind = kind;
        }

        match component.record_store.apply(&record).await {
            Ok(true) => tracing::debug!(key = %key, kind = %record.kind, "applied record pulled from {}", peer),
            Ok(false) => tracing::debug!(key = %key, "pulled record from {} was not newer", peer),
            Err(e) => tracing::warn!(key = %key, "failed to apply pulled record: {}", e),
        }
    }
}

#[async_trait]
impl TaskHandler for TaskExecutor {
    async fn handle(&self, task: ExecuteTask) {
        match task {
            ExecuteTask::Sync { key, attempt, created } => {
                self.sync(key, ChangeKind::Change, attempt, created).await
            }
            ExecuteTask::Delete { key, attempt, created } => {
                self.sync(key, ChangeKind::Delete, attempt, created).await
            }
            ExecuteTask::Pull { key, kind } => self.pull(key, kind).await,
        }
    }
}
