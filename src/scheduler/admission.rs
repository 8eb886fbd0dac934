use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::scheduler::job::JobId;

/// A job this process is currently driving.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub id: JobId,
    pub started_at: Instant,
    /// Past negotiation and persisting its verdict.
    pub committing: bool,
    cancel: CancellationToken,
}

impl RunningJob {
    fn new(id: JobId) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            committing: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Executing-slot bookkeeping.
///
/// This is a cache of which `Executing` records this process has a task for;
/// the store's state index stays the source of truth. A job with an
/// `Executing` record but no slot here was left over by an earlier process.
#[derive(Debug)]
pub struct Admission {
    running: HashMap<JobId, RunningJob>,
    max_parallel: usize,
}

impl Admission {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            running: HashMap::new(),
            max_parallel,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.max_parallel.saturating_sub(self.running.len())
    }

    pub fn is_running(&self, id: &JobId) -> bool {
        self.running.contains_key(id)
    }

    /// Take a slot for `id`, returning the token its task must watch.
    /// A job already holding a slot keeps its existing token.
    pub fn start(&mut self, id: JobId) -> CancellationToken {
        let job = self.running.entry(id).or_insert_with(|| {
            tracing::debug!(job_id = %id, "Slot granted");
            RunningJob::new(id)
        });
        job.cancel.clone()
    }

    /// Mark `id` as committing its verdict. Cancellation no longer changes
    /// its outcome.
    pub fn begin_commit(&mut self, id: &JobId) {
        if let Some(job) = self.running.get_mut(id) {
            job.committing = true;
        }
    }

    pub fn is_committing(&self, id: &JobId) -> bool {
        self.running.get(id).is_some_and(|job| job.committing)
    }

    /// Release the slot held by `id`.
    pub fn finish(&mut self, id: &JobId) -> bool {
        match self.running.remove(id) {
            Some(job) => {
                tracing::debug!(job_id = %id, elapsed_ms = job.elapsed().as_millis() as u64, "Slot released");
                true
            }
            None => false,
        }
    }

    /// Signal cancellation to a running job. Returns false if `id` holds no
    /// slot.
    pub fn cancel(&self, id: &JobId) -> bool {
        match self.running.get(id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running(&self) -> Vec<&RunningJob> {
        self.running.values().collect()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}
