//! Distro Protocol
//!
//! Composition of the replication engines behind one handle: registration,
//! outbound change scheduling, inbound handlers for the RPC layer, and the
//! lifecycle of every background loop.

use crate::distro::component::ComponentRegistry;
use crate::distro::config::SharedDistroConfig;
use crate::distro::delay::{DelayTask, DelayTaskEngine, WorkerDispatcher};
use crate::distro::error::{DistroError, Result};
use crate::distro::load::SnapshotLoader;
use crate::distro::ports::{DelayedRetryPolicy, FailurePolicy, MemberDirectory, RecordStore, TransportAgent};
use crate::distro::retry::{RetryBus, RetryPublisher};
use crate::distro::task::TaskExecutor;
use crate::distro::types::{ChangeKind, PeerAddr, ReplicationKey, ReplicationRecord};
use crate::distro::verify::{plan_pulls, VerifyTask};
use crate::distro::worker::{ExecuteEngine, ExecuteTask};
use crate::infrastructure::ShutdownController;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Callback invoked by a record store on every local write.
pub type ChangeListener = Arc<dyn Fn(&ReplicationKey, ChangeKind) + Send + Sync>;

/// Replication engine of one node.
pub struct DistroProtocol {
    self_addr: PeerAddr,
    config: SharedDistroConfig,
    components: Arc<ComponentRegistry>,
    members: Arc<dyn MemberDirectory>,
    delay_engine: Arc<DelayTaskEngine>,
    execute_engine: Arc<ExecuteEngine>,
    retry_bus: RetryBus,
    verify: Arc<VerifyTask>,
    loader: Arc<SnapshotLoader>,
    shutdown: ShutdownController,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DistroProtocol {
    pub fn new(config: SharedDistroConfig, members: Arc<dyn MemberDirectory>) -> Self {
        let self_addr = members.self_address();
        let components = Arc::new(ComponentRegistry::new());
        let retry_bus = RetryBus::new();

        let executor = TaskExecutor::new(components.clone(), retry_bus.publisher(), self_addr.clone());
        let execute_engine = Arc::new(ExecuteEngine::new(config.get().worker_count, Arc::new(executor)));
        let delay_engine = Arc::new(DelayTaskEngine::new(Arc::new(WorkerDispatcher::new(
            execute_engine.clone(),
        ))));
        let verify = Arc::new(VerifyTask::new(components.clone(), members.clone()));
        let loader = Arc::new(SnapshotLoader::new(components.clone(), members.clone(), config.clone()));

        Self {
            self_addr,
            config,
            components,
            members,
            delay_engine,
            execute_engine,
            retry_bus,
            verify,
            loader,
            shutdown: ShutdownController::new(),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register a data domain. Fails on a duplicate data type.
    pub fn register(
        &self,
        data_type: impl Into<String>,
        record_store: Arc<dyn RecordStore>,
        transport: Arc<dyn TransportAgent>,
        failure_policy: Arc<dyn FailurePolicy>,
    ) -> Result<()> {
        self.components
            .register(data_type, record_store, transport, failure_policy)
    }

    /// Register a data domain with the default retry policy.
    pub fn register_default(
        &self,
        data_type: impl Into<String>,
        record_store: Arc<dyn RecordStore>,
        transport: Arc<dyn TransportAgent>,
    ) -> Result<()> {
        let policy = Arc::new(DelayedRetryPolicy::new(self.config.clone()));
        self.register(data_type, record_store, transport, policy)
    }

    /// Spawn the scan loop, workers, retry subscriber, verify timer and
    /// snapshot loaders. A second call does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = self.handles.lock();
        handles.push(self.delay_engine.start(&self.shutdown));
        handles.extend(self.execute_engine.start(&self.shutdown));
        if let Some(handle) =
            self.retry_bus
                .spawn_subscriber(self.components.clone(), self.delay_engine.clone(), &self.shutdown)
        {
            handles.push(handle);
        }
        handles.push(self.verify.start(self.config.clone(), &self.shutdown));
        handles.extend(self.loader.start(&self.shutdown));

        tracing::info!(
            "distro protocol started on {} ({} workers, {} domains)",
            self.self_addr,
            self.execute_engine.worker_count(),
            self.components.len()
        );
    }

    /// Schedule a sync of `key` to every `Up` peer after `sync_delay`.
    pub fn sync(&self, key: &ReplicationKey, kind: ChangeKind) {
        let delay = self.config.sync_delay();
        for member in self.members.up_members_excluding_self() {
            self.sync_to(key.local().with_target(member.address), kind, delay);
        }
    }

    /// Schedule a sync to the peer named in `key` after `delay`.
    pub fn sync_to(&self, key: ReplicationKey, kind: ChangeKind, delay: Duration) {
        if self.shutdown.is_shutdown() {
            tracing::debug!(key = %key, "ignoring sync after shutdown");
            return;
        }
        self.delay_engine.add_task(key, DelayTask::new(kind, delay));
    }

    /// Listener to install on a record store so local writes are replicated.
    pub fn change_listener(self: &Arc<Self>) -> ChangeListener {
        let protocol: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |key: &ReplicationKey, kind: ChangeKind| {
            if let Some(protocol) = protocol.upgrade() {
                protocol.sync(key, kind);
            }
        })
    }

    /// Apply a record pushed by a peer.
    pub async fn on_receive_record(&self, record: ReplicationRecord) -> Result<bool> {
        if record.kind == ChangeKind::Verify {
            return Err(DistroError::InvalidRecord(
                "verify summaries are not applied as records".to_string(),
            ));
        }
        let component = self.components.lookup(&record.key.data_type)?;
        let changed = component.record_store.apply(&record).await?;
        tracing::debug!(key = %record.key, kind = %record.kind, changed, "received record");
        Ok(changed)
    }

    /// Compare a peer's summary with local state and schedule pulls for what
    /// is missing or older here. Returns the number of pulls scheduled.
    pub async fn on_receive_verify(&self, summary: ReplicationRecord, from: &PeerAddr) -> Result<usize> {
        if summary.kind != ChangeKind::Verify {
            return Err(DistroError::InvalidRecord(format!(
                "expected a verify summary, got {}",
                summary.kind
            )));
        }
        let component = self.components.lookup(&summary.key.data_type)?;
        let pulls = plan_pulls(component.record_store.as_ref(), &summary).await;

        for (resource_id, kind) in &pulls {
            let key = ReplicationKey::new(summary.key.data_type.clone(), resource_id.clone())
                .with_target(from.clone());
            self.execute_engine.submit(ExecuteTask::Pull { key, kind: *kind })?;
        }
        if !pulls.is_empty() {
            tracing::info!(
                "{}: {} resources differ from {}, pulling",
                summary.key.data_type,
                pulls.len(),
                from
            );
        }
        Ok(pulls.len())
    }

    /// Serve a peer's fetch of one record.
    pub async fn on_query(&self, key: &ReplicationKey) -> Result<ReplicationRecord> {
        let component = self.components.lookup(&key.data_type)?;
        component.record_store.get_record(&key.resource_id).await
    }

    /// Serve a peer's full-state request.
    pub async fn on_snapshot(&self, data_type: &str) -> Result<Vec<ReplicationRecord>> {
        let component = self.components.lookup(data_type)?;
        Ok(component.record_store.snapshot().await)
    }

    /// True once every domain has finished its startup snapshot load.
    pub fn is_initialized(&self) -> bool {
        self.loader.all_loaded()
    }

    /// Stop every loop and wait up to `drain_timeout` for in-flight tasks.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.shutdown.shutdown();
        self.shutdown.wait_for_drain(drain_timeout).await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("replication task ended abnormally: {}", e);
            }
        }
        tracing::info!(
            "distro protocol on {} stopped, {} tasks left pending",
            self.self_addr,
            self.delay_engine.pending_count()
        );
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    pub fn self_address(&self) -> &PeerAddr {
        &self.self_addr
    }

    pub fn config(&self) -> &SharedDistroConfig {
        &self.config
    }

    pub fn components(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    pub fn members(&self) -> &Arc<dyn MemberDirectory> {
        &self.members
    }

    pub fn delay_engine(&self) -> &Arc<DelayTaskEngine> {
        &self.delay_engine
    }

    pub fn execute_engine(&self) -> &Arc<ExecuteEngine> {
        &self.execute_engine
    }

    pub fn retry_publisher(&self) -> RetryPublisher {
        self.retry_bus.publisher()
    }

    pub fn verify_task(&self) -> &Arc<VerifyTask> {
        &self.verify
    }
}
