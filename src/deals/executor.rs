use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::deals::{DealProposal, NegotiationError, Negotiator};
use crate::error::SchedulerError;
use crate::scheduler::job::{ContentId, DealError, DealRecord, JobId, StorageConfig};
use crate::selector::MinerProposal;

/// Per-miner results of one execution, in selection order.
#[derive(Debug, Default)]
pub struct DealOutcome {
    pub deals: Vec<DealRecord>,
    pub errors: Vec<DealError>,
    /// Cancellation was observed before every negotiation settled.
    pub canceled: bool,
}

/// Negotiates deals with a job's selected miners.
///
/// At most `concurrency` negotiations run at once. The cancellation token is
/// checked before each negotiation starts; once it fires no new negotiation
/// is started and in-flight ones are abandoned.
#[derive(Clone)]
pub struct DealExecutor {
    negotiator: Arc<dyn Negotiator>,
    concurrency: usize,
    timeout: Option<Duration>,
}

impl DealExecutor {
    pub fn new(negotiator: Arc<dyn Negotiator>, concurrency: usize) -> Self {
        Self {
            negotiator,
            concurrency: concurrency.max(1),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn execute(
        &self,
        job_id: JobId,
        content_id: &ContentId,
        config: &StorageConfig,
        miners: &[MinerProposal],
        cancel: &CancellationToken,
    ) -> DealOutcome {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut results: Vec<Option<Result<String, NegotiationError>>> =
            miners.iter().map(|_| None).collect();
        let mut started = 0;
        let mut canceled = false;

        for (idx, miner) in miners.iter().enumerate() {
            if cancel.is_cancelled() {
                canceled = true;
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    canceled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let proposal = DealProposal {
                content_id: content_id.clone(),
                miner: miner.address.clone(),
                epoch_price: miner.epoch_price,
                duration: config.deal_duration,
            };
            let negotiator = self.negotiator.clone();
            let timeout = self.timeout;
            tracing::debug!(job_id = %job_id, miner = %proposal.miner, "Proposing deal");
            tasks.spawn(async move {
                let _permit = permit;
                let res = match timeout {
                    Some(limit) => tokio::time::timeout(limit, negotiator.propose(&proposal))
                        .await
                        .unwrap_or_else(|_| Err(NegotiationError::new("negotiation timed out"))),
                    None => negotiator.propose(&proposal).await,
                };
                (idx, res)
            });
            started += 1;
        }

        while !canceled {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    canceled = true;
                    break;
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                Some(Ok((idx, res))) => results[idx] = Some(res),
                Some(Err(e)) => {
                    tracing::error!(job_id = %job_id, error = %e, "Negotiation task failed");
                }
                None => break,
            }
        }
        if canceled {
            tasks.abort_all();
            tracing::info!(job_id = %job_id, started, "Deal execution canceled");
        }

        let mut outcome = DealOutcome {
            canceled,
            ..Default::default()
        };
        for (miner, res) in miners.iter().zip(results).take(started) {
            match res {
                Some(Ok(proposal_cid)) => {
                    tracing::info!(
                        job_id = %job_id,
                        miner = %miner.address,
                        proposal_cid = %proposal_cid,
                        "Deal accepted"
                    );
                    outcome.deals.push(DealRecord {
                        miner: miner.address.clone(),
                        proposal_cid,
                        epoch_price: miner.epoch_price,
                    });
                }
                Some(Err(e)) => {
                    let failure = SchedulerError::NegotiationFailed {
                        miner: miner.address.clone(),
                        message: e.message.clone(),
                    };
                    tracing::warn!(job_id = %job_id, error = %failure, "Deal not made");
                    outcome.record_failure(miner, e.proposal_cid, e.message);
                }
                None if canceled => {}
                None => outcome.record_failure(
                    miner,
                    None,
                    "negotiation aborted unexpectedly".to_string(),
                ),
            }
        }
        outcome
    }
}

impl DealOutcome {
    fn record_failure(
        &mut self,
        miner: &MinerProposal,
        proposal_cid: Option<String>,
        message: String,
    ) {
        self.errors.push(DealError {
            proposal_cid,
            miner: miner.address.clone(),
            message,
        });
    }
}
