use crate::distro::{ConfigError, DistroConfig};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Node identity and sockets
    pub node_addr: Option<String>,
    pub gossip_addr: String,
    pub transport_addr: String,
    pub bootstrap_peers: Vec<String>,
    pub data_types: Vec<String>,
    pub debug: bool,

    // Replication tunables
    pub sync_delay_ms: u64,
    pub sync_retry_delay_ms: u64,
    pub verify_interval_ms: u64,
    pub load_data_retry_delay_ms: u64,
    pub worker_count: Option<usize>,
    pub max_sync_retries: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_addr: None,
            gossip_addr: "0.0.0.0:4001".to_string(),
            transport_addr: "0.0.0.0:4002".to_string(),
            bootstrap_peers: Vec::new(),
            data_types: vec!["instances".to_string()],
            debug: false,
            sync_delay_ms: 1000,
            sync_retry_delay_ms: 3000,
            verify_interval_ms: 5000,
            load_data_retry_delay_ms: 30000,
            worker_count: None,
            max_sync_retries: None,
        }
    }
}

impl Config {
    /// Address advertised to peers; the transport bind address unless overridden.
    pub fn advertised_addr(&self) -> &str {
        self.node_addr.as_deref().unwrap_or(&self.transport_addr)
    }

    /// Replication engine settings derived from this config.
    pub fn distro_config(&self) -> Result<DistroConfig, ConfigError> {
        let mut cfg = DistroConfig::new()
            .sync_delay(Duration::from_millis(self.sync_delay_ms))
            .sync_retry_delay(Duration::from_millis(self.sync_retry_delay_ms))
            .verify_interval(Duration::from_millis(self.verify_interval_ms))
            .load_data_retry_delay(Duration::from_millis(self.load_data_retry_delay_ms))
            .max_sync_retries(self.max_sync_retries);
        if let Some(workers) = self.worker_count {
            cfg = cfg.worker_count(workers);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Build the config from a variable lookup, falling back to defaults on
/// absence or parse failure.
pub fn load_config_from<F>(var: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();
    let millis = |name: &str, default: u64| var(name).and_then(|v| v.parse().ok()).unwrap_or(default);

    Config {
        node_addr: var("DISTRO_NODE_ADDR"),
        gossip_addr: var("DISTRO_GOSSIP_ADDR").unwrap_or(defaults.gossip_addr),
        transport_addr: var("DISTRO_TRANSPORT_ADDR").unwrap_or(defaults.transport_addr),
        bootstrap_peers: var("DISTRO_BOOTSTRAP_PEERS")
            .map(|v| split_list(&v))
            .unwrap_or_default(),
        data_types: var("DISTRO_DATA_TYPES")
            .map(|v| split_list(&v))
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.data_types),
        debug: var("DEBUG").is_some(),
        sync_delay_ms: millis("DISTRO_SYNC_DELAY_MS", defaults.sync_delay_ms),
        sync_retry_delay_ms: millis("DISTRO_SYNC_RETRY_DELAY_MS", defaults.sync_retry_delay_ms),
        verify_interval_ms: millis("DISTRO_VERIFY_INTERVAL_MS", defaults.verify_interval_ms),
        load_data_retry_delay_ms: millis("DISTRO_LOAD_DATA_RETRY_DELAY_MS", defaults.load_data_retry_delay_ms),
        worker_count: var("DISTRO_WORKER_COUNT").and_then(|v| v.parse().ok()),
        max_sync_retries: var("DISTRO_MAX_SYNC_RETRIES").and_then(|v| v.parse().ok()),
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    Ok(load_config_from(|name| std::env::var(name).ok()))
}
