//! Deal negotiation against selected miners.
//!
//! - [`Negotiator`]: the external collaborator that proposes a deal to one
//!   miner. It may be slow and may fail.
//! - [`DealExecutor`]: drives a job's proposals with bounded parallelism and
//!   cooperative cancellation, collecting one outcome per miner.
//! - [`DevnetNegotiator`]: simulated miners for local runs and tests.

pub mod devnet;
pub mod executor;

use async_trait::async_trait;
use thiserror::Error;

use crate::scheduler::job::ContentId;

pub use devnet::{DevnetConfig, DevnetNegotiator};
pub use executor::{DealExecutor, DealOutcome};

/// Terms proposed to a single miner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealProposal {
    pub content_id: ContentId,
    pub miner: String,
    pub epoch_price: u64,
    pub duration: i64,
}

/// A failed negotiation. `proposal_cid` is set only if the negotiation got
/// far enough to produce a proposal before failing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct NegotiationError {
    pub proposal_cid: Option<String>,
    pub message: String,
}

impl NegotiationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            proposal_cid: None,
            message: message.into(),
        }
    }

    pub fn with_proposal(proposal_cid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            proposal_cid: Some(proposal_cid.into()),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Propose a deal, returning the accepted proposal's identifier.
    ///
    /// The future may be dropped at any await point when the job is
    /// canceled.
    async fn propose(&self, proposal: &DealProposal) -> Result<String, NegotiationError>;
}
