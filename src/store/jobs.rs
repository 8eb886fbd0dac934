use std::sync::Arc;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{Job, JobId, JobState};
use crate::store::{Datastore, StoreError, StoreResult, Txn};

const JOBS_PREFIX: &str = "/jobs/";
const INDEX_PREFIX: &str = "/index/";
const NEXT_SEQ_KEY: &str = "/meta/next_seq";

fn job_key(id: &JobId) -> String {
    format!("{}{}", JOBS_PREFIX, id)
}

fn state_prefix(state: JobState) -> String {
    format!("{}{}/", INDEX_PREFIX, state)
}

fn index_key(job: &Job) -> String {
    format!("{}{:020}/{}", state_prefix(job.state), job.seq, job.id)
}

fn read_job(txn: &Txn<'_>, id: &JobId) -> StoreResult<Option<Job>> {
    txn.get(&job_key(id))?
        .map(|raw| serde_json::from_slice(&raw))
        .transpose()
        .map_err(StoreError::from)
}

/// Write `job` and move its index entry from `previous` if the state or
/// sequence changed.
fn write_job(txn: &mut Txn<'_>, job: &Job, previous: Option<&Job>) -> StoreResult<()> {
    if let Some(prev) = previous {
        let old_index = index_key(prev);
        if old_index != index_key(job) {
            txn.delete(old_index);
        }
    }
    txn.put(job_key(&job.id), serde_json::to_vec(job)?);
    txn.put(index_key(job), Vec::new());
    Ok(())
}

/// Checks that `next` is a legal successor of `prev`: a forward state move,
/// unchanged identity and policy, and append-only deal errors.
fn check_transition(prev: &Job, next: &Job) -> Result<()> {
    let invalid = || SchedulerError::InvalidTransition {
        id: prev.id,
        from: prev.state,
        to: next.state,
    };
    if next.id != prev.id
        || next.seq != prev.seq
        || next.content_id != prev.content_id
        || next.storage_config != prev.storage_config
        || next.created_at != prev.created_at
    {
        return Err(invalid());
    }
    if next.state != prev.state && !prev.state.can_transition_to(next.state) {
        return Err(invalid());
    }
    if next.deal_errors.len() < prev.deal_errors.len()
        || next.deal_errors[..prev.deal_errors.len()] != prev.deal_errors[..]
    {
        return Err(invalid());
    }
    Ok(())
}

/// Typed job persistence over a [`Datastore`].
///
/// Every mutation is a single datastore transaction covering the job record
/// and its state index entry.
#[derive(Clone)]
pub struct JobStore {
    ds: Arc<dyn Datastore>,
}

impl JobStore {
    pub fn new(ds: Arc<dyn Datastore>) -> Self {
        Self { ds }
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.ds
    }

    /// Persist a new job, assigning it the next submission sequence.
    pub fn submit(&self, mut job: Job) -> Result<Job> {
        self.ds.update(&mut |txn| {
            let seq = match txn.get(NEXT_SEQ_KEY)? {
                Some(raw) => serde_json::from_slice::<u64>(&raw)?,
                None => 1,
            };
            job.seq = seq;
            write_job(txn, &job, None)?;
            txn.put(NEXT_SEQ_KEY, serde_json::to_vec(&(seq + 1))?);
            Ok(())
        })?;
        Ok(job)
    }

    /// Insert or replace a record as-is, keeping the index consistent.
    pub fn put(&self, job: &Job) -> Result<()> {
        self.ds.update(&mut |txn| {
            let previous = read_job(txn, &job.id)?;
            write_job(txn, job, previous.as_ref())
        })?;
        Ok(())
    }

    pub fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let raw = self.ds.get(&job_key(id))?;
        Ok(raw
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()
            .map_err(StoreError::from)?)
    }

    /// Remove a record and its index entry. Returns whether it existed.
    pub fn delete(&self, id: &JobId) -> Result<bool> {
        let mut existed = false;
        self.ds.update(&mut |txn| {
            if let Some(job) = read_job(txn, id)? {
                txn.delete(index_key(&job));
                txn.delete(job_key(id));
                existed = true;
            }
            Ok(())
        })?;
        Ok(existed)
    }

    /// Jobs in `state`, oldest submission first.
    pub fn list_by_state(&self, state: JobState, limit: Option<usize>) -> Result<Vec<Job>> {
        let entries = self.ds.scan_prefix(&state_prefix(state))?;
        let mut jobs = Vec::new();
        for (key, _) in entries.into_iter().take(limit.unwrap_or(usize::MAX)) {
            let Some(id) = key.rsplit('/').next().and_then(|s| s.parse::<JobId>().ok()) else {
                tracing::warn!(key = %key, "Skipping malformed index key");
                continue;
            };
            match self.get(&id)? {
                // The record is authoritative; a stale index entry is ignored.
                Some(job) if job.state == state => jobs.push(job),
                _ => tracing::warn!(job_id = %id, state = %state, "Index entry without matching job"),
            }
        }
        Ok(jobs)
    }

    /// All jobs in submission order.
    pub fn list_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for (_, raw) in self.ds.scan_prefix(JOBS_PREFIX)? {
            jobs.push(serde_json::from_slice::<Job>(&raw).map_err(StoreError::from)?);
        }
        jobs.sort_by_key(|j| j.seq);
        Ok(jobs)
    }

    /// Atomically read, modify and write one job.
    ///
    /// `f` runs inside the transaction; if it fails, or produces a record
    /// that is not a legal successor of the stored one, nothing is written
    /// and the error is returned.
    pub fn transition<F>(&self, id: &JobId, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let mut f = Some(f);
        let mut rejected: Option<SchedulerError> = None;
        let mut committed: Option<Job> = None;

        let res = self.ds.update(&mut |txn| {
            let Some(prev) = read_job(txn, id)? else {
                rejected = Some(SchedulerError::JobNotFound(*id));
                return Err(StoreError::Aborted);
            };
            let Some(f) = f.take() else {
                return Err(StoreError::Aborted);
            };
            let mut next = prev.clone();
            if let Err(e) = f(&mut next).and_then(|_| check_transition(&prev, &next)) {
                rejected = Some(e);
                return Err(StoreError::Aborted);
            }
            write_job(txn, &next, Some(&prev))?;
            committed = Some(next);
            Ok(())
        });

        match res {
            Ok(()) => committed.ok_or(SchedulerError::Persistence(StoreError::Aborted)),
            Err(StoreError::Aborted) => {
                Err(rejected.unwrap_or(SchedulerError::Persistence(StoreError::Aborted)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Independent copy of the whole store at this instant.
    pub fn snapshot(&self) -> Result<JobStore> {
        Ok(JobStore::new(Arc::new(self.ds.snapshot()?)))
    }
}
