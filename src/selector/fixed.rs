use crate::error::Result;
use crate::selector::{select_from_pool, Miner, MinerProposal, MinerSelector, MinerSelectorFilter};

/// Selects from a fixed pool, backfilling in configured order.
#[derive(Debug, Clone)]
pub struct FixedMinerSelector {
    miners: Vec<Miner>,
}

impl FixedMinerSelector {
    pub fn new(miners: Vec<Miner>) -> Self {
        Self { miners }
    }
}

impl MinerSelector for FixedMinerSelector {
    fn get_miners(&self, n: usize, filter: &MinerSelectorFilter) -> Result<Vec<MinerProposal>> {
        let proposals = select_from_pool(&self.miners, n, filter)?;
        tracing::debug!(
            requested = n,
            miners = ?proposals.iter().map(|p| p.address.as_str()).collect::<Vec<_>>(),
            "Selected miners from fixed pool"
        );
        Ok(proposals)
    }
}
