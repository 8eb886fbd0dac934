use std::cmp::Reverse;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::selector::{select_from_pool, Miner, MinerProposal, MinerSelector, MinerSelectorFilter};

/// A pool entry with a reputation score; higher is better.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredMiner {
    #[serde(flatten)]
    pub miner: Miner,
    #[serde(default)]
    pub score: u32,
}

/// Backfills by descending reputation. Equal scores keep configured order so
/// selection never flaps between otherwise-equal miners.
#[derive(Debug, Clone)]
pub struct ReputationMinerSelector {
    ranked: Vec<Miner>,
}

impl ReputationMinerSelector {
    pub fn new(mut miners: Vec<ScoredMiner>) -> Self {
        // sort_by_key is stable
        miners.sort_by_key(|m| Reverse(m.score));
        Self {
            ranked: miners.into_iter().map(|m| m.miner).collect(),
        }
    }

    pub fn ranked(&self) -> &[Miner] {
        &self.ranked
    }
}

impl MinerSelector for ReputationMinerSelector {
    fn get_miners(&self, n: usize, filter: &MinerSelectorFilter) -> Result<Vec<MinerProposal>> {
        let proposals = select_from_pool(&self.ranked, n, filter)?;
        tracing::debug!(
            requested = n,
            miners = ?proposals.iter().map(|p| p.address.as_str()).collect::<Vec<_>>(),
            "Selected miners by reputation"
        );
        Ok(proposals)
    }
}
