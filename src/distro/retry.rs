//! Retry Bus
//!
//! Failed syncs publish a [`RetryEvent`] instead of touching the scheduler.
//! A dedicated subscriber consults the domain's failure policy and puts the
//! task back into the delay engine.

use crate::distro::component::ComponentRegistry;
use crate::distro::delay::{DelayTask, DelayTaskEngine};
use crate::distro::ports::RetryDecision;
use crate::distro::types::{ChangeKind, ReplicationKey};
use crate::infrastructure::ShutdownController;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A sync that must be attempted again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEvent {
    pub key: ReplicationKey,
    pub kind: ChangeKind,
    /// 1 for the first retry
    pub attempt: u32,
    /// When the change being retried was originally requested
    pub created: Instant,
}

impl RetryEvent {
    pub fn new(key: ReplicationKey, kind: ChangeKind, attempt: u32) -> Self {
        Self {
            key,
            kind,
            attempt,
            created: Instant::now(),
        }
    }

    /// Keep the creation time of the original change.
    pub fn created_at(mut self, created: Instant) -> Self {
        self.created = created;
        self
    }
}

/// Sending half of the retry bus; cheap to clone.
#[derive(Debug, Clone)]
pub struct RetryPublisher {
    tx: mpsc::UnboundedSender<RetryEvent>,
    published: Arc<AtomicU64>,
}

impl RetryPublisher {
    /// Publish a retry. Never blocks; returns false once the bus is closed.
    pub fn publish(&self, event: RetryEvent) -> bool {
        tracing::debug!(key = %event.key, kind = %event.kind, attempt = event.attempt, "retry event published");
        match self.tx.send(event) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                tracing::warn!("retry bus closed, dropping retry event");
                false
            }
        }
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Unbounded retry channel.
pub struct RetryBus {
    publisher: RetryPublisher,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RetryEvent>>>,
}

impl RetryBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            publisher: RetryPublisher {
                tx,
                published: Arc::new(AtomicU64::new(0)),
            },
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn publisher(&self) -> RetryPublisher {
        self.publisher.clone()
    }

    /// Get the receiver (can only be called once).
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<RetryEvent>> {
        self.rx.lock().take()
    }

    /// Start the subscriber that re-enqueues failed syncs.
    pub fn spawn_subscriber(
        &self,
        components: Arc<ComponentRegistry>,
        delay_engine: Arc<DelayTaskEngine>,
        shutdown: &ShutdownController,
    ) -> Option<JoinHandle<()>> {
        let mut rx = self.take_receiver()?;
        let mut shutdown_rx = shutdown.subscribe();
        let shutdown = shutdown.clone();

        Some(tokio::spawn(async move {
            loop {
                if shutdown.is_shutdown() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            reschedule(&event, &components, &delay_engine);
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!("retry subscriber stopped");
        }))
    }
}

impl Default for RetryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the domain's failure policy to one event. Returns the decision taken.
pub fn reschedule(
    event: &RetryEvent,
    components: &ComponentRegistry,
    delay_engine: &DelayTaskEngine,
) -> RetryDecision {
    let component = match components.lookup(&event.key.data_type) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(key = %event.key, "cannot retry: {}", e);
            return RetryDecision::Drop;
        }
    };

    let decision = component.failure_policy.on_failure(event);
    match decision {
        RetryDecision::Retry(delay) => {
            tracing::warn!(
                key = %event.key,
                kind = %event.kind,
                attempt = event.attempt,
                "sync failed, retrying in {:?}",
                delay
            );
            let task = DelayTask::new(event.kind, delay)
                .attempt(event.attempt)
                .created_at(event.created);
            delay_engine.add_task(event.key.clone(), task);
        }
        RetryDecision::Drop => {
            tracing::warn!(
                key = %event.key,
                attempt = event.attempt,
                "sync retries exhausted, leaving repair to verify"
            );
        }
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::config::{DistroConfig, SharedDistroConfig};
    use crate::distro::delay::DelayTaskProcessor;
    use crate::distro::testing::{NullStore, NullTransport};
    use crate::distro::ports::DelayedRetryPolicy;
    use crate::distro::types::PeerAddr;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct Discard;

    impl DelayTaskProcessor for Discard {
        fn process(&self, _key: &ReplicationKey, _task: &DelayTask) -> bool {
            true
        }
    }

    fn key() -> ReplicationKey {
        ReplicationKey::new("instances", "svc-1").with_target(PeerAddr::new("b:1"))
    }

    fn registry(config: SharedDistroConfig) -> ComponentRegistry {
        let registry = ComponentRegistry::new();
        registry
            .register(
                "instances",
                Arc::new(NullStore),
                Arc::new(NullTransport),
                Arc::new(DelayedRetryPolicy::new(config)),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_publish_counts_events() {
        let bus = RetryBus::new();
        let publisher = bus.publisher();

        assert!(publisher.publish(RetryEvent::new(key(), ChangeKind::Change, 1)));
        assert!(publisher.publish(RetryEvent::new(key(), ChangeKind::Change, 2)));
        assert_eq!(publisher.published(), 2);

        let mut rx = bus.take_receiver().unwrap();
        assert_eq!(rx.try_recv().unwrap().attempt, 1);
        assert_eq!(rx.try_recv().unwrap().attempt, 2);
    }

    #[test]
    fn test_take_receiver_once() {
        let bus = RetryBus::new();
        assert!(bus.take_receiver().is_some());
        assert!(bus.take_receiver().is_none());
    }

    #[test]
    fn test_publish_after_close() {
        let bus = RetryBus::new();
        let publisher = bus.publisher();
        drop(bus.take_receiver());

        assert!(!publisher.publish(RetryEvent::new(key(), ChangeKind::Change, 1)));
        assert_eq!(publisher.published(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_adds_delayed_task() {
        let config = SharedDistroConfig::new(
            DistroConfig::new().sync_retry_delay(Duration::from_millis(300)),
        )
        .unwrap();
        let components = registry(config);
        let engine = DelayTaskEngine::new(Arc::new(Discard));

        let decision = reschedule(&RetryEvent::new(key(), ChangeKind::Change, 1), &components, &engine);

        assert_eq!(decision, RetryDecision::Retry(Duration::from_millis(300)));
        let task = engine.get_task(&key()).unwrap();
        assert_eq!(task.kind, ChangeKind::Change);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.deadline, Instant::now() + Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_reschedule_respects_cap() {
        let config = SharedDistroConfig::new(DistroConfig::new().max_sync_retries(Some(1))).unwrap();
        let components = registry(config);
        let engine = DelayTaskEngine::new(Arc::new(Discard));

        let decision = reschedule(&RetryEvent::new(key(), ChangeKind::Change, 2), &components, &engine);

        assert_eq!(decision, RetryDecision::Drop);
        assert_eq!(engine.pending_count(), 0);
        assert!(logs_contain("sync retries exhausted"));
    }

    #[tokio::test]
    async fn test_reschedule_unknown_component() {
        let components = ComponentRegistry::new();
        let engine = DelayTaskEngine::new(Arc::new(Discard));

        let decision = reschedule(&RetryEvent::new(key(), ChangeKind::Change, 1), &components, &engine);
        assert_eq!(decision, RetryDecision::Drop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_reenqueues() {
        let config = SharedDistroConfig::new(DistroConfig::default()).unwrap();
        let components = Arc::new(registry(config));
        let engine = Arc::new(DelayTaskEngine::new(Arc::new(Discard)));
        let shutdown = ShutdownController::new();
        let bus = RetryBus::new();

        let handle = bus
            .spawn_subscriber(components, engine.clone(), &shutdown)
            .unwrap();
        bus.publisher().publish(RetryEvent::new(key(), ChangeKind::Delete, 1));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.get_task(&key()).unwrap().kind, ChangeKind::Delete);

        shutdown.shutdown();
        handle.await.unwrap();
    }
}
