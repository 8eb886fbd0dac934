use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use uuid::Uuid;

use crate::deals::{DealProposal, NegotiationError, Negotiator};
use crate::scheduler::job::ContentId;

/// Behavior of the simulated miners.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevnetConfig {
    /// Largest payload a miner accepts, in bytes.
    pub sector_size: u64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Size assumed for content that was never registered.
    pub default_content_size: u64,
    /// Miners that reject every proposal.
    pub rejecting_miners: BTreeSet<String>,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            sector_size: 2048,
            min_latency_ms: 50,
            max_latency_ms: 200,
            default_content_size: 1024,
            rejecting_miners: BTreeSet::new(),
        }
    }
}

/// Simulated negotiation with local miners, in the spirit of a small-sector
/// devnet: oversized payloads are rejected, everything else is accepted after
/// a random delay.
#[derive(Debug, Default)]
pub struct DevnetNegotiator {
    config: DevnetConfig,
    content_sizes: RwLock<HashMap<ContentId, u64>>,
}

impl DevnetNegotiator {
    pub fn new(config: DevnetConfig) -> Self {
        Self {
            config,
            content_sizes: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_content(&self, content_id: ContentId, size: u64) {
        if let Ok(mut sizes) = self.content_sizes.write() {
            sizes.insert(content_id, size);
        }
    }

    fn content_size(&self, content_id: &ContentId) -> u64 {
        self.content_sizes
            .read()
            .ok()
            .and_then(|sizes| sizes.get(content_id).copied())
            .unwrap_or(self.config.default_content_size)
    }

    fn latency(&self) -> Duration {
        let min = self.config.min_latency_ms;
        let max = self.config.max_latency_ms.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[async_trait]
impl Negotiator for DevnetNegotiator {
    async fn propose(&self, proposal: &DealProposal) -> Result<String, NegotiationError> {
        let delay = self.latency();
        tokio::time::sleep(delay).await;

        if self.config.rejecting_miners.contains(&proposal.miner) {
            return Err(NegotiationError::new("deal rejected by miner"));
        }
        let size = self.content_size(&proposal.content_id);
        if size > self.config.sector_size {
            return Err(NegotiationError::new("data doesn't fit in a sector"));
        }
        Ok(format!("bafyprop{}", Uuid::new_v4().simple()))
    }
}
