//! Distro Configuration
//!
//! Tunables for the replication core. Loaded once at startup and mutable at
//! runtime through [`SharedDistroConfig`].

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the replication engines.
#[derive(Debug, Clone, PartialEq)]
pub struct DistroConfig {
    /// Debounce window for change-driven sync (default: 1s)
    pub sync_delay: Duration,

    /// Backoff before a failed sync is retried (default: 3s)
    pub sync_retry_delay: Duration,

    /// Anti-entropy period (default: 5s)
    pub verify_interval: Duration,

    /// Wait between startup snapshot attempts (default: 30s)
    pub load_data_retry_delay: Duration,

    /// Deadline for a single snapshot fetch (default: 30s)
    pub load_data_timeout: Duration,

    /// Number of sharded dispatch workers (default: available cores)
    pub worker_count: usize,

    /// Failed syncs are dropped after this many retries; `None` retries forever
    pub max_sync_retries: Option<u32>,
}

impl Default for DistroConfig {
    fn default() -> Self {
        Self {
            sync_delay: Duration::from_millis(1000),
            sync_retry_delay: Duration::from_millis(3000),
            verify_interval: Duration::from_millis(5000),
            load_data_retry_delay: Duration::from_millis(30000),
            load_data_timeout: Duration::from_millis(30000),
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_sync_retries: None,
        }
    }
}

impl DistroConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce window.
    pub fn sync_delay(mut self, delay: Duration) -> Self {
        self.sync_delay = delay;
        self
    }

    /// Set the retry backoff.
    pub fn sync_retry_delay(mut self, delay: Duration) -> Self {
        self.sync_retry_delay = delay;
        self
    }

    /// Set the verify period.
    pub fn verify_interval(mut self, interval: Duration) -> Self {
        self.verify_interval = interval;
        self
    }

    /// Set the startup catch-up retry delay.
    pub fn load_data_retry_delay(mut self, delay: Duration) -> Self {
        self.load_data_retry_delay = delay;
        self
    }

    /// Set the snapshot fetch deadline.
    pub fn load_data_timeout(mut self, timeout: Duration) -> Self {
        self.load_data_timeout = timeout;
        self
    }

    /// Set the worker pool size.
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Cap sync retries.
    pub fn max_sync_retries(mut self, max: Option<u32>) -> Self {
        self.max_sync_retries = max;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        let durations = [
            ("sync_delay", self.sync_delay),
            ("sync_retry_delay", self.sync_retry_delay),
            ("verify_interval", self.verify_interval),
            ("load_data_retry_delay", self.load_data_retry_delay),
            ("load_data_timeout", self.load_data_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("worker_count must be at least 1")]
    ZeroWorkers,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Runtime-mutable handle to the [`DistroConfig`].
///
/// Readers take a snapshot, so an update applies from the next debounce,
/// retry or verify cycle onwards.
#[derive(Debug, Clone)]
pub struct SharedDistroConfig {
    inner: Arc<RwLock<DistroConfig>>,
}

impl SharedDistroConfig {
    pub fn new(config: DistroConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
        })
    }

    /// Current configuration snapshot.
    pub fn get(&self) -> DistroConfig {
        self.inner.read().clone()
    }

    /// Replace the configuration. Invalid values are rejected and the old
    /// configuration stays in place.
    pub fn set(&self, config: DistroConfig) -> Result<(), ConfigError> {
        config.validate()?;
        tracing::info!(?config, "distro config reloaded");
        *self.inner.write() = config;
        Ok(())
    }

    /// Apply an in-place edit, validating the result.
    pub fn update<F>(&self, edit: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut DistroConfig),
    {
        let mut next = self.get();
        edit(&mut next);
        self.set(next)
    }

    pub fn sync_delay(&self) -> Duration {
        self.inner.read().sync_delay
    }

    pub fn sync_retry_delay(&self) -> Duration {
        self.inner.read().sync_retry_delay
    }

    pub fn verify_interval(&self) -> Duration {
        self.inner.read().verify_interval
    }

    pub fn load_data_retry_delay(&self) -> Duration {
        self.inner.read().load_data_retry_delay
    }
}

impl Default for SharedDistroConfig {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(DistroConfig::default())),
        }
    }
}
