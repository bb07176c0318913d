//! Failure Policy Port
//!
//! Decides what happens to a sync that failed.

use crate::distro::config::SharedDistroConfig;
use crate::distro::retry::RetryEvent;
use std::time::Duration;

/// Outcome of a failed sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue into the delay engine after the given delay.
    Retry(Duration),
    /// Give up; the verify cycle will heal the divergence.
    Drop,
}

/// Per-domain handling of failed syncs.
pub trait FailurePolicy: Send + Sync {
    fn on_failure(&self, event: &RetryEvent) -> RetryDecision;
}

/// Retries after `sync_retry_delay`, optionally capped by `max_sync_retries`.
pub struct DelayedRetryPolicy {
    config: SharedDistroConfig,
}

impl DelayedRetryPolicy {
    pub fn new(config: SharedDistroConfig) -> Self {
        Self { config }
    }
}

impl FailurePolicy for DelayedRetryPolicy {
    fn on_failure(&self, event: &RetryEvent) -> RetryDecision {
        let config = self.config.get();
        match config.max_sync_retries {
            Some(max) if event.attempt > max => RetryDecision::Drop,
            _ => RetryDecision::Retry(config.sync_retry_delay),
        }
    }
}
