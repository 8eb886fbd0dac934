use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::deals::DevnetConfig;
use crate::error::{Result, SchedulerError};
use crate::selector::{Miner, ScoredMiner};

/// Default cap on concurrently executing jobs.
pub const DEFAULT_MAX_PARALLEL: usize = 50;

/// Scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum jobs in `Executing` at once.
    pub max_parallel: usize,
    /// Period of the admission loop's safety sweep.
    pub admission_interval_ms: u64,
    /// Delay between attempts to commit a job's terminal state.
    pub persist_retry_interval_ms: u64,
    /// Negotiations in flight per job.
    pub deal_concurrency: usize,
    /// Per-negotiation time limit. `None` waits indefinitely.
    pub negotiation_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            admission_interval_ms: 500,
            persist_retry_interval_ms: 250,
            deal_concurrency: 4,
            negotiation_timeout_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn admission_interval(&self) -> Duration {
        Duration::from_millis(self.admission_interval_ms)
    }

    pub fn persist_retry_interval(&self) -> Duration {
        Duration::from_millis(self.persist_retry_interval_ms)
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.deal_concurrency == 0 {
            return Err(SchedulerError::InvalidConfig(
                "deal_concurrency must be at least 1".to_string(),
            ));
        }
        if self.admission_interval_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "admission_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Miner selection strategy and its candidate pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SelectorConfig {
    Fixed { miners: Vec<Miner> },
    Reputation { miners: Vec<ScoredMiner> },
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig::Fixed { miners: Vec::new() }
    }
}

impl SelectorConfig {
    pub fn pool_size(&self) -> usize {
        match self {
            SelectorConfig::Fixed { miners } => miners.len(),
            SelectorConfig::Reputation { miners } => miners.len(),
        }
    }
}

/// A parsed bootstrap multiaddr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub host: String,
    pub port: u16,
    pub peer_id: String,
}

/// Seed addresses per network, resolved once at start.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub network: String,
    pub bootstrappers: HashMap<String, Vec<String>>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let mut bootstrappers = HashMap::new();
        bootstrappers.insert(
            "mainnet".to_string(),
            [
                "/dns4/seed1.filestar.net/tcp/51024/p2p/12D3KooWNFBi3Ysg8cH8r6xHVzSLMFjKx2Ee14PzYts8qxymKPca",
                "/dns4/seed2.filestar.net/tcp/51024/p2p/12D3KooWF15XCfM8XNLANFfZZQaj89xtgrroTZ1GAXpfEgd8mAYp",
                "/dns4/seed3.filestar.net/tcp/51024/p2p/12D3KooWRWpnA6KMpoqXgXB1Ssc77B6TcEWJcNFtMqSYgS2UumT9",
                "/dns4/seed4.filestar.net/tcp/51024/p2p/12D3KooWDfiABDDLFsEUNrNpSvsWELRoiXxEenyXSsjxsSNUyFTd",
                "/dns4/seed5.filestar.net/tcp/51024/p2p/12D3KooW9tfsWnw7vZUzX6Bie12YcdyVuj7enskHKUTkotZkfnox",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        );
        bootstrappers.insert(
            "calibrationnet".to_string(),
            [
                "/dns4/bootstrap-0.calibration.fildev.network/tcp/1347/p2p/12D3KooWRLZAseMo9h7fRD6ojn6YYDXHsBSavX5YmjBZ9ngtAEec",
                "/dns4/bootstrap-1.calibration.fildev.network/tcp/1347/p2p/12D3KooWJFtDXgZEQMEkjJPSrbfdvh2xfjVKrXeNFG1t8ioJXAzv",
                "/dns4/bootstrap-2.calibration.fildev.network/tcp/1347/p2p/12D3KooWP1uB9Lo7yCA3S17TD4Y5wStP5Nk7Vqh53m8GsFjkyujD",
                "/dns4/bootstrap-3.calibration.fildev.network/tcp/1347/p2p/12D3KooWLrPM4WPK1YRGPCUwndWcDX8GCYgms3DiuofUmxwvhMCn",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        );
        Self {
            network: "mainnet".to_string(),
            bootstrappers,
        }
    }
}

impl NetworkConfig {
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_bootstrappers(mut self, network: impl Into<String>, addrs: Vec<String>) -> Self {
        self.bootstrappers.insert(network.into(), addrs);
        self
    }

    /// Resolve the configured network's seed addresses.
    pub fn bootstrap_peers(&self) -> Result<Vec<BootstrapPeer>> {
        let addrs = self
            .bootstrappers
            .get(&self.network)
            .filter(|addrs| !addrs.is_empty())
            .ok_or_else(|| {
                SchedulerError::InvalidConfig(format!(
                    "network {} doesn't have any configured bootstrappers",
                    self.network
                ))
            })?;
        addrs.iter().map(|addr| parse_bootstrap_addr(addr)).collect()
    }
}

/// Parse `/<dns4|dns6|dns|ip4|ip6>/<host>/tcp/<port>/p2p/<peer-id>`.
fn parse_bootstrap_addr(addr: &str) -> Result<BootstrapPeer> {
    let invalid = || SchedulerError::InvalidConfig(format!("invalid bootstrap address: {}", addr));

    let parts: Vec<&str> = addr.split('/').collect();
    match parts.as_slice() {
        ["", proto, host, "tcp", port, "p2p", peer_id]
            if matches!(*proto, "dns" | "dns4" | "dns6" | "ip4" | "ip6")
                && !host.is_empty()
                && !peer_id.is_empty() =>
        {
            let port: u16 = port.parse().map_err(|_| invalid())?;
            Ok(BootstrapPeer {
                host: host.to_string(),
                port,
                peer_id: peer_id.to_string(),
            })
        }
        _ => Err(invalid()),
    }
}

/// Everything the binary needs, loadable from a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub scheduler: SchedulerConfig,
    pub selector: SelectorConfig,
    pub network: NetworkConfig,
    pub devnet: DevnetConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./deal-scheduler-data"),
            scheduler: SchedulerConfig::default(),
            selector: SelectorConfig::default(),
            network: NetworkConfig::default(),
            devnet: DevnetConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::InvalidConfig(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(raw)
            .map_err(|e| SchedulerError::InvalidConfig(format!("parsing config: {}", e)))?;
        config.scheduler.validate()?;
        Ok(config)
    }
}
