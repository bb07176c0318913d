//! Delay Queue Engine
//!
//! Debounces change notifications: at most one pending task per
//! [`ReplicationKey`], handed to a processor once its deadline passes.
//!
//! Adding a task for a key that is already pending merges the two. The later
//! intent wins and the deadline restarts, so a burst of writes to one
//! resource turns into a single sync carrying the latest state.

use crate::distro::types::{ChangeKind, ReplicationKey};
use crate::distro::worker::{ExecuteEngine, ExecuteTask};
use crate::infrastructure::ShutdownController;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default interval between scans for expired tasks.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// A pending unit of work for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayTask {
    pub kind: ChangeKind,
    /// Failed attempts so far (0 for a fresh change)
    pub attempt: u32,
    /// When the intent was first expressed
    pub created: Instant,
    /// When the task becomes ready
    pub deadline: Instant,
}

impl DelayTask {
    /// A fresh task that becomes ready after `delay`.
    pub fn new(kind: ChangeKind, delay: Duration) -> Self {
        let now = Instant::now();
        Self {
            kind,
            attempt: 0,
            created: now,
            deadline: now + delay,
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn created_at(mut self, created: Instant) -> Self {
        self.created = created;
        self
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    /// Merge an incoming task into this pending one.
    ///
    /// The deadline always restarts from the incoming task. The change kind
    /// follows whichever intent is newer, so a late retry of an old change
    /// never overrides a change requested after it.
    pub fn merge(&mut self, incoming: DelayTask) {
        if incoming.created >= self.created {
            self.kind = incoming.kind;
            self.attempt = incoming.attempt;
            self.created = incoming.created;
        }
        self.deadline = incoming.deadline;
    }
}

/// Turns an expired task into executable work.
pub trait DelayTaskProcessor: Send + Sync {
    /// Returns false if the task could not be handed off; it is then put back.
    fn process(&self, key: &ReplicationKey, task: &DelayTask) -> bool;
}

/// Pending-task table plus the scan loop.
pub struct DelayTaskEngine {
    tasks: DashMap<ReplicationKey, DelayTask>,
    processors: DashMap<String, Arc<dyn DelayTaskProcessor>>,
    default_processor: Arc<dyn DelayTaskProcessor>,
    scan_interval: Duration,
}

impl DelayTaskEngine {
    pub fn new(default_processor: Arc<dyn DelayTaskProcessor>) -> Self {
        Self {
            tasks: DashMap::new(),
            processors: DashMap::new(),
            default_processor,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }

    /// Set the scan interval.
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Use a dedicated processor for one data type.
    pub fn add_processor(&self, data_type: impl Into<String>, processor: Arc<dyn DelayTaskProcessor>) {
        self.processors.insert(data_type.into(), processor);
    }

    fn processor_for(&self, key: &ReplicationKey) -> Arc<dyn DelayTaskProcessor> {
        self.processors
            .get(&key.data_type)
            .map(|p| p.value().clone())
            .unwrap_or_else(|| self.default_processor.clone())
    }

    /// Add a task, merging with any task already pending for the key.
    pub fn add_task(&self, key: ReplicationKey, task: DelayTask) {
        match self.tasks.entry(key) {
            Entry::Occupied(mut pending) => {
                tracing::debug!(key = %pending.key(), kind = %task.kind, "merging pending task");
                pending.get_mut().merge(task);
            }
            Entry::Vacant(slot) => {
                tracing::debug!(key = %slot.key(), kind = %task.kind, "task scheduled");
                slot.insert(task);
            }
        }
    }

    pub fn remove_task(&self, key: &ReplicationKey) -> Option<DelayTask> {
        self.tasks.remove(key).map(|(_, task)| task)
    }

    pub fn get_task(&self, key: &ReplicationKey) -> Option<DelayTask> {
        self.tasks.get(key).map(|t| t.value().clone())
    }

    pub fn contains(&self, key: &ReplicationKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Hand every expired task to its processor. Returns how many were processed.
    ///
    /// Each task leaves the table in a single `remove_if`, so an `add_task`
    /// racing with the scan either lands before removal (and is dispatched
    /// now) or after it (and starts a new delay cycle).
    pub fn process_ready(&self) -> usize {
        let now = Instant::now();
        let ready: Vec<ReplicationKey> = self
            .tasks
            .iter()
            .filter(|e| e.value().is_ready(now))
            .map(|e| e.key().clone())
            .collect();

        let mut processed = 0;
        for key in ready {
            let Some((key, task)) = self.tasks.remove_if(&key, |_, t| t.is_ready(now)) else {
                continue;
            };

            if self.processor_for(&key).process(&key, &task) {
                processed += 1;
            } else {
                tracing::warn!(key = %key, "task processing failed, re-queueing");
                self.tasks.entry(key).or_insert(task);
            }
        }
        processed
    }

    /// Start the scan loop.
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownController) -> JoinHandle<()> {
        let engine = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.scan_interval);
            loop {
                if shutdown.is_shutdown() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        engine.process_ready();
                    }
                }
            }
            tracing::debug!("delay engine stopped, {} tasks left pending", engine.pending_count());
        })
    }
}

/// Default processor: converts ready tasks into worker submissions.
pub struct WorkerDispatcher {
    execute_engine: Arc<ExecuteEngine>,
}

impl WorkerDispatcher {
    pub fn new(execute_engine: Arc<ExecuteEngine>) -> Self {
        Self { execute_engine }
    }
}

impl DelayTaskProcessor for WorkerDispatcher {
    fn process(&self, key: &ReplicationKey, task: &DelayTask) -> bool {
        let execute = match task.kind {
            ChangeKind::Delete => ExecuteTask::Delete {
                key: key.clone(),
                attempt: task.attempt,
                created: task.created,
            },
            ChangeKind::Add | ChangeKind::Change | ChangeKind::Snapshot => ExecuteTask::Sync {
                key: key.clone(),
                attempt: task.attempt,
                created: task.created,
            },
            ChangeKind::Verify => {
                tracing::warn!(key = %key, "verify records are not scheduled through the delay engine");
                return true;
            }
        };
        self.execute_engine.submit(execute).is_ok()
    }
}
