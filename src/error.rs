use thiserror::Error;

use crate::scheduler::job::{JobId, JobState};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("not enough miners to provide, want {requested}, got {found}")]
    InsufficientCandidates { requested: usize, found: usize },

    #[error("negotiation with miner {miner} failed: {message}")]
    NegotiationFailed { miner: String, message: String },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {id} is already in terminal state {state}")]
    AlreadyTerminal { id: JobId, state: JobState },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
