//! Miner selection policies.
//!
//! A [`MinerSelector`] turns a job's replication policy into an ordered,
//! deduplicated list of miners to propose deals to. Selection is pure: it
//! does no I/O and keeps no state between calls.
//!
//! Every strategy shares the same two-pass walk:
//!
//! 1. Trusted miners, in the order the filter lists them. Only the price cap
//!    applies here, so operators can pin miners outside the country allow-list.
//! 2. Backfill from the strategy's candidate order, skipping miners already
//!    picked, excluded miners, over-priced miners and disallowed countries.
//!
//! Strategies differ only in the backfill order:
//!
//! - [`FixedMinerSelector`]: the pool exactly as configured
//! - [`ReputationMinerSelector`]: highest score first

pub mod fixed;
pub mod reputation;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::SelectorConfig;
use crate::error::{Result, SchedulerError};

pub use fixed::FixedMinerSelector;
pub use reputation::{ReputationMinerSelector, ScoredMiner};

/// A known miner in the candidate pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Miner {
    pub address: String,
    #[serde(default)]
    pub country: String,
    pub epoch_price: u64,
}

impl Miner {
    pub fn new(address: impl Into<String>, country: impl Into<String>, epoch_price: u64) -> Self {
        Self {
            address: address.into(),
            country: country.into(),
            epoch_price,
        }
    }
}

/// A selected miner and the price it is believed willing to contract at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerProposal {
    pub address: String,
    pub epoch_price: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinerSelectorFilter {
    pub trusted_miners: Vec<String>,
    pub excluded_miners: BTreeSet<String>,
    pub country_codes: Vec<String>,
    /// Zero means unbounded.
    pub max_price: u64,
}

impl MinerSelectorFilter {
    fn price_allowed(&self, miner: &Miner) -> bool {
        self.max_price == 0 || miner.epoch_price <= self.max_price
    }

    fn country_allowed(&self, miner: &Miner) -> bool {
        self.country_codes.is_empty() || self.country_codes.iter().any(|c| *c == miner.country)
    }
}

pub trait MinerSelector: Send + Sync {
    /// Return exactly `n` miners for `filter`, or `InsufficientCandidates`.
    fn get_miners(&self, n: usize, filter: &MinerSelectorFilter) -> Result<Vec<MinerProposal>>;
}

/// Build the selector strategy named by configuration.
pub fn build_selector(config: &SelectorConfig) -> Arc<dyn MinerSelector> {
    match config {
        SelectorConfig::Fixed { miners } => Arc::new(FixedMinerSelector::new(miners.clone())),
        SelectorConfig::Reputation { miners } => {
            Arc::new(ReputationMinerSelector::new(miners.clone()))
        }
    }
}

/// Two-pass selection over `pool`, which is already in backfill order.
pub(crate) fn select_from_pool(
    pool: &[Miner],
    n: usize,
    filter: &MinerSelectorFilter,
) -> Result<Vec<MinerProposal>> {
    let mut selected = Vec::with_capacity(n);
    if n == 0 {
        return Ok(selected);
    }
    let mut seen: HashSet<&str> = HashSet::new();

    for trusted in &filter.trusted_miners {
        if selected.len() == n {
            break;
        }
        let Some(miner) = pool.iter().find(|m| m.address == *trusted) else {
            continue;
        };
        if !filter.price_allowed(miner) || !seen.insert(miner.address.as_str()) {
            continue;
        }
        selected.push(MinerProposal {
            address: miner.address.clone(),
            epoch_price: miner.epoch_price,
        });
    }

    for miner in pool {
        if selected.len() == n {
            break;
        }
        if seen.contains(miner.address.as_str())
            || filter.excluded_miners.contains(&miner.address)
            || !filter.price_allowed(miner)
            || !filter.country_allowed(miner)
        {
            continue;
        }
        seen.insert(miner.address.as_str());
        selected.push(MinerProposal {
            address: miner.address.clone(),
            epoch_price: miner.epoch_price,
        });
    }

    if selected.len() != n {
        return Err(SchedulerError::InsufficientCandidates {
            requested: n,
            found: selected.len(),
        });
    }
    Ok(selected)
}
