//! Worker Dispatch Engine
//!
//! Fixed pool of workers, each draining its own unbounded queue in order.
//! A task goes to worker `shard_hash(key) % worker_count`, so two tasks for
//! the same key never run concurrently and run in submission order.

use crate::distro::error::{DistroError, Result};
use crate::distro::types::{ChangeKind, ReplicationKey};
use crate::infrastructure::ShutdownController;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Closed set of executable tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteTask {
    /// Push the current record for `key.resource_id` to `key.target_peer`.
    Sync {
        key: ReplicationKey,
        attempt: u32,
        created: Instant,
    },
    /// Push a deletion marker to `key.target_peer` without reading the store.
    Delete {
        key: ReplicationKey,
        attempt: u32,
        created: Instant,
    },
    /// Fetch the authoritative record from `key.target_peer` and apply it as `kind`.
    Pull { key: ReplicationKey, kind: ChangeKind },
}

impl ExecuteTask {
    pub fn key(&self) -> &ReplicationKey {
        match self {
            ExecuteTask::Sync { key, .. } | ExecuteTask::Delete { key, .. } | ExecuteTask::Pull { key, .. } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecuteTask::Sync { .. } => "sync",
            ExecuteTask::Delete { .. } => "delete",
            ExecuteTask::Pull { .. } => "pull",
        }
    }
}

/// Runs one task to completion on a worker.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: ExecuteTask);
}

/// Sharded worker pool.
pub struct ExecuteEngine {
    senders: Vec<mpsc::UnboundedSender<ExecuteTask>>,
    receivers: Mutex<Vec<mpsc::UnboundedReceiver<ExecuteTask>>>,
    handler: Arc<dyn TaskHandler>,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
}

impl ExecuteEngine {
    /// Create the pool; queues accept tasks immediately, workers run after `start`.
    pub fn new(worker_count: usize, handler: Arc<dyn TaskHandler>) -> Self {
        let worker_count = worker_count.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..worker_count).map(|_| mpsc::unbounded_channel()).unzip();

        Self {
            senders,
            receivers: Mutex::new(receivers),
            handler,
            submitted: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Worker that owns `key`.
    pub fn worker_index(&self, key: &ReplicationKey) -> usize {
        key.shard_hash() as usize % self.senders.len()
    }

    /// Queue a task on its key's worker. Never blocks.
    pub fn submit(&self, task: ExecuteTask) -> Result<()> {
        let index = self.worker_index(task.key());
        tracing::debug!(key = %task.key(), worker = index, "submitting {} task", task.name());
        self.senders[index]
            .send(task)
            .map_err(|_| DistroError::Shutdown)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Spawn the workers. A second call spawns nothing.
    ///
    /// On shutdown each worker finishes the task it is running and drops
    /// whatever is still queued.
    pub fn start(&self, shutdown: &ShutdownController) -> Vec<JoinHandle<()>> {
        let receivers = std::mem::take(&mut *self.receivers.lock());

        receivers
            .into_iter()
            .enumerate()
            .map(|(index, mut rx)| {
                let handler = self.handler.clone();
                let completed = self.completed.clone();
                let mut shutdown_rx = shutdown.subscribe();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    loop {
                        if shutdown.is_shutdown() {
                            break;
                        }
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.recv() => break,
                            task = rx.recv() => match task {
                                Some(task) => {
                                    let _guard = shutdown.task_guard();
                                    handler.handle(task).await;
                                    completed.fetch_add(1, Ordering::Relaxed);
                                }
                                None => break,
                            },
                        }
                    }
                    rx.close();
                    let mut dropped = 0usize;
                    while rx.try_recv().is_ok() {
                        dropped += 1;
                    }
                    if dropped > 0 {
                        tracing::debug!(worker = index, "discarded {} queued tasks", dropped);
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::types::PeerAddr;
    use std::time::Duration;

    /// Records start/end of every task, sleeping in between.
    #[derive(Default)]
    struct Tracer {
        events: Mutex<Vec<(String, &'static str)>>,
        work: Duration,
    }

    #[async_trait]
    impl TaskHandler for Tracer {
        async fn handle(&self, task: ExecuteTask) {
            let id = match &task {
                ExecuteTask::Sync { attempt, .. } => format!("{}#{}", task.key().resource_id, attempt),
                _ => task.key().resource_id.clone(),
            };
            self.events.lock().push((id.clone(), "start"));
            tokio::time::sleep(self.work).await;
            self.events.lock().push((id, "end"));
        }
    }

    fn sync(id: &str, attempt: u32) -> ExecuteTask {
        ExecuteTask::Sync {
            key: ReplicationKey::new("instances", id).with_target(PeerAddr::new("b:1")),
            attempt,
            created: Instant::now(),
        }
    }

    #[test]
    fn test_task_accessors() {
        let task = ExecuteTask::Pull {
            key: ReplicationKey::new("instances", "svc-1"),
            kind: ChangeKind::Add,
        };
        assert_eq!(task.name(), "pull");
        assert_eq!(task.key().resource_id, "svc-1");
    }

    #[tokio::test]
    async fn test_same_key_same_worker() {
        let engine = ExecuteEngine::new(8, Arc::new(Tracer::default()));
        let key = ReplicationKey::new("instances", "svc-1").with_target(PeerAddr::new("b:1"));

        let index = engine.worker_index(&key);
        assert!(index < 8);
        assert_eq!(engine.worker_index(&key.clone()), index);
    }

    #[tokio::test]
    async fn test_zero_workers_clamped() {
        let engine = ExecuteEngine::new(0, Arc::new(Tracer::default()));
        assert_eq!(engine.worker_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_runs_sequentially() {
        let tracer = Arc::new(Tracer {
            work: Duration::from_millis(50),
            ..Default::default()
        });
        let engine = ExecuteEngine::new(4, tracer.clone());
        let shutdown = ShutdownController::new();
        engine.start(&shutdown);

        engine.submit(sync("svc-1", 1)).unwrap();
        engine.submit(sync("svc-1", 2)).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let events = tracer.events.lock().clone();
        assert_eq!(
            events,
            vec![
                ("svc-1#1".to_string(), "start"),
                ("svc-1#1".to_string(), "end"),
                ("svc-1#2".to_string(), "start"),
                ("svc-1#2".to_string(), "end"),
            ]
        );
        assert_eq!(engine.completed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_before_start_is_queued() {
        let tracer = Arc::new(Tracer::default());
        let engine = ExecuteEngine::new(2, tracer.clone());

        engine.submit(sync("svc-1", 0)).unwrap();
        assert_eq!(engine.submitted(), 1);
        assert!(tracer.events.lock().is_empty());

        let shutdown = ShutdownController::new();
        engine.start(&shutdown);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.completed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_finishes_in_flight_and_drops_queued() {
        let tracer = Arc::new(Tracer {
            work: Duration::from_millis(100),
            ..Default::default()
        });
        let engine = ExecuteEngine::new(1, tracer.clone());
        let shutdown = ShutdownController::new();
        let handles = engine.start(&shutdown);

        engine.submit(sync("svc-1", 0)).unwrap();
        engine.submit(sync("svc-2", 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        shutdown.shutdown();
        assert!(shutdown.wait_for_drain(Duration::from_secs(1)).await);
        for handle in handles {
            handle.await.unwrap();
        }

        let events = tracer.events.lock().clone();
        assert_eq!(
            events,
            vec![("svc-1#0".to_string(), "start"), ("svc-1#0".to_string(), "end")]
        );
        assert!(matches!(engine.submit(sync("svc-3", 0)), Err(DistroError::Shutdown)));
    }
}
