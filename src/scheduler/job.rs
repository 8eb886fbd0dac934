use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::selector::MinerSelectorFilter;

/// Default deal duration in epochs (~180 days at 30s epochs).
pub const DEFAULT_DEAL_DURATION: i64 = 518_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of the content-addressed payload a job stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(cid: impl Into<String>) -> Self {
        Self(cid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Executing,
    Success,
    Failed,
    Canceled,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Queued,
        JobState::Executing,
        JobState::Success,
        JobState::Failed,
        JobState::Canceled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Canceled
        )
    }

    /// Whether `next` is a legal forward move from this state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Executing) => true,
            (JobState::Queued, JobState::Canceled) => true,
            (JobState::Executing, n) => n.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Executing => "executing",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state: {}", s))
    }
}

/// Replication policy snapshot attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Successful deals required for the job to succeed.
    pub rep_factor: usize,
    /// Miners to prefer, in priority order.
    pub trusted_miners: Vec<String>,
    /// Miners never to use.
    pub excluded_miners: BTreeSet<String>,
    /// Allowed miner jurisdictions; empty allows all.
    pub country_codes: Vec<String>,
    /// Upper bound on a miner's epoch price; zero means unbounded.
    pub max_price: u64,
    /// Deal duration in epochs.
    pub deal_duration: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            rep_factor: 1,
            trusted_miners: Vec::new(),
            excluded_miners: BTreeSet::new(),
            country_codes: Vec::new(),
            max_price: 0,
            deal_duration: DEFAULT_DEAL_DURATION,
        }
    }
}

impl StorageConfig {
    pub fn with_rep_factor(mut self, rep_factor: usize) -> Self {
        self.rep_factor = rep_factor;
        self
    }

    pub fn with_trusted_miner(mut self, addr: impl Into<String>) -> Self {
        self.trusted_miners.push(addr.into());
        self
    }

    pub fn with_excluded_miner(mut self, addr: impl Into<String>) -> Self {
        self.excluded_miners.insert(addr.into());
        self
    }

    pub fn with_country_code(mut self, code: impl Into<String>) -> Self {
        self.country_codes.push(code.into());
        self
    }

    pub fn with_max_price(mut self, max_price: u64) -> Self {
        self.max_price = max_price;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rep_factor == 0 {
            return Err(SchedulerError::InvalidConfig(
                "replication factor must be at least 1".to_string(),
            ));
        }
        if self.deal_duration <= 0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "deal duration must be positive, got {}",
                self.deal_duration
            )));
        }
        Ok(())
    }

    /// Selector filter derived from this policy.
    pub fn filter(&self) -> MinerSelectorFilter {
        MinerSelectorFilter {
            trusted_miners: self.trusted_miners.clone(),
            excluded_miners: self.excluded_miners.clone(),
            country_codes: self.country_codes.clone(),
            max_price: self.max_price,
        }
    }
}

/// A miner that did not yield a deal. `proposal_cid` is `None` when
/// negotiation never reached a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealError {
    pub proposal_cid: Option<String>,
    pub miner: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealRecord {
    pub miner: String,
    pub proposal_cid: String,
    pub epoch_price: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Submission order, assigned by the store.
    pub seq: u64,
    pub content_id: ContentId,
    pub storage_config: StorageConfig,
    pub state: JobState,
    pub err_cause: Option<String>,
    pub deal_errors: Vec<DealError>,
    pub deals: Vec<DealRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(content_id: ContentId, storage_config: StorageConfig) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            seq: 0,
            content_id,
            storage_config,
            state: JobState::Queued,
            err_cause: None,
            deal_errors: Vec::new(),
            deals: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing anything but a forward transition.
    pub fn set_state(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            if self.state.is_terminal() {
                return Err(SchedulerError::AlreadyTerminal {
                    id: self.id,
                    state: self.state,
                });
            }
            return Err(SchedulerError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
