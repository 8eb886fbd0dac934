use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::deals::{DealExecutor, Negotiator};
use crate::error::{Result, SchedulerError};
use crate::scheduler::admission::Admission;
use crate::scheduler::job::{ContentId, DealError, DealRecord, Job, JobId, JobState, StorageConfig};
use crate::selector::MinerSelector;
use crate::store::JobStore;

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Final result of driving one job, folded into the record in a single
/// transition.
#[derive(Debug, Clone)]
struct Verdict {
    state: JobState,
    cause: Option<String>,
    deals: Vec<DealRecord>,
    errors: Vec<DealError>,
}

impl Verdict {
    fn canceled() -> Self {
        Self {
            state: JobState::Canceled,
            cause: None,
            deals: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn failed(cause: String) -> Self {
        Self {
            state: JobState::Failed,
            cause: Some(cause),
            deals: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn apply(self, job: &mut Job) -> Result<()> {
        job.set_state(self.state)?;
        job.err_cause = self.cause;
        job.deals.extend(self.deals);
        job.deal_errors.extend(self.errors);
        Ok(())
    }
}

struct Inner {
    config: SchedulerConfig,
    store: JobStore,
    selector: Arc<dyn MinerSelector>,
    executor: DealExecutor,
    admission: Mutex<Admission>,
    wake: Notify,
    stopping: CancellationToken,
    updates: broadcast::Sender<Job>,
}

/// Drives storage jobs from submission to a terminal state.
///
/// A supervising loop ([`Scheduler::run`]) promotes `Queued` jobs to
/// `Executing` in submission order while slots are free, and spawns one task
/// per promoted job. Every state change is a single [`JobStore::transition`],
/// so a restarted scheduler pointed at the same store picks up exactly where
/// the previous one stopped.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: JobStore,
        selector: Arc<dyn MinerSelector>,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<Self> {
        config.validate()?;
        let executor = DealExecutor::new(negotiator, config.deal_concurrency)
            .with_timeout(config.negotiation_timeout());
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                admission: Mutex::new(Admission::new(config.max_parallel)),
                config,
                store,
                selector,
                executor,
                wake: Notify::new(),
                stopping: CancellationToken::new(),
                updates,
            }),
        })
    }

    /// Persist a new `Queued` job and return without waiting for it to run.
    pub async fn submit(
        &self,
        content_id: ContentId,
        storage_config: StorageConfig,
    ) -> Result<JobId> {
        if self.inner.stopping.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        storage_config.validate()?;

        let job = self.inner.store.submit(Job::new(content_id, storage_config))?;
        tracing::info!(
            job_id = %job.id,
            content_id = %job.content_id,
            rep_factor = job.storage_config.rep_factor,
            "Job submitted"
        );
        self.inner.publish(&job);
        self.inner.wake.notify_one();
        Ok(job.id)
    }

    /// Cancel a job.
    ///
    /// A queued job is canceled immediately. An executing job is signaled
    /// and its task records `Canceled` without waiting for in-flight
    /// negotiations. Canceling a terminal job is a no-op.
    ///
    /// A job whose negotiations have already settled and whose task is
    /// persisting the verdict is not interrupted: this returns `Ok(())` but
    /// the job still ends `Success` or `Failed`. Check [`Scheduler::status`]
    /// for the outcome.
    pub async fn cancel(&self, id: &JobId) -> Result<()> {
        let admission = self.inner.admission.lock().await;
        let job = self
            .inner
            .store
            .get(id)?
            .ok_or(SchedulerError::JobNotFound(*id))?;

        if job.state.is_terminal() {
            tracing::debug!(job_id = %id, state = %job.state, "Cancel ignored for finished job");
            return Ok(());
        }
        if job.state == JobState::Executing && admission.is_committing(id) {
            tracing::debug!(
                job_id = %id,
                "Cancel ignored, job is already committing its result"
            );
            return Ok(());
        }
        if job.state == JobState::Executing && admission.cancel(id) {
            tracing::info!(job_id = %id, "Cancellation requested");
            return Ok(());
        }

        // Queued, or an executing record no task here is driving yet.
        match self
            .inner
            .store
            .transition(id, |job| job.set_state(JobState::Canceled))
        {
            Ok(job) => {
                tracing::info!(job_id = %id, "Job canceled");
                self.inner.publish(&job);
                Ok(())
            }
            Err(SchedulerError::AlreadyTerminal { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Last committed snapshot of a job.
    pub fn status(&self, id: &JobId) -> Result<Job> {
        self.inner
            .store
            .get(id)?
            .ok_or(SchedulerError::JobNotFound(*id))
    }

    /// Jobs in submission order, optionally restricted to one state.
    pub fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        match state {
            Some(state) => self.inner.store.list_by_state(state, None),
            None => self.inner.store.list_all(),
        }
    }

    /// Receive every job record as it is committed.
    pub fn watch(&self) -> broadcast::Receiver<Job> {
        self.inner.updates.subscribe()
    }

    /// Jobs this process is currently driving.
    pub async fn running_jobs(&self) -> Vec<JobId> {
        let admission = self.inner.admission.lock().await;
        admission.running().iter().map(|job| job.id).collect()
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Stop admitting jobs and abandon running ones, leaving them
    /// `Executing` for the next process to resume.
    pub fn shutdown(&self) {
        self.inner.stopping.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.stopping.is_cancelled()
    }

    /// Run the admission loop until `shutdown` fires.
    ///
    /// On start, every unfinished job in the store is picked up: `Executing`
    /// records from a previous process are re-driven first, then `Queued`
    /// ones in submission order.
    pub async fn run(&self, shutdown: CancellationToken) {
        match self.inner.resume_counts() {
            Ok((executing, queued)) => tracing::info!(
                max_parallel = self.inner.config.max_parallel,
                executing,
                queued,
                "Starting scheduler"
            ),
            Err(e) => tracing::error!(error = %e, "Failed to scan unfinished jobs"),
        }

        let mut interval = tokio::time::interval(self.inner.config.admission_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.stopping.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = interval.tick() => {}
            }
            match self.inner.admit().await {
                Ok(0) => {}
                Ok(admitted) => tracing::debug!(admitted, "Admission pass"),
                Err(e) => tracing::error!(error = %e, "Admission pass failed"),
            }
        }

        self.inner.stopping.cancel();
        tracing::info!("Scheduler stopped");
    }
}

impl Inner {
    fn publish(&self, job: &Job) {
        // No receivers is fine.
        let _ = self.updates.send(job.clone());
    }

    fn resume_counts(&self) -> Result<(usize, usize)> {
        let executing = self.store.list_by_state(JobState::Executing, None)?.len();
        let queued = self.store.list_by_state(JobState::Queued, None)?.len();
        Ok((executing, queued))
    }

    /// Fill free slots: orphaned `Executing` jobs first, then `Queued` jobs
    /// oldest first. Returns how many tasks were spawned.
    async fn admit(self: &Arc<Self>) -> Result<usize> {
        let mut admission = self.admission.lock().await;
        if self.stopping.is_cancelled() {
            return Ok(0);
        }
        let free = admission.free_slots();
        if free == 0 {
            return Ok(0);
        }

        let mut candidates: Vec<Job> = self
            .store
            .list_by_state(JobState::Executing, None)?
            .into_iter()
            .filter(|job| !admission.is_running(&job.id))
            .collect();
        if candidates.len() < free {
            candidates.extend(
                self.store
                    .list_by_state(JobState::Queued, Some(free - candidates.len()))?,
            );
        }

        let mut admitted = 0;
        for job in candidates.into_iter().take(free) {
            let job = if job.state == JobState::Queued {
                let job = self
                    .store
                    .transition(&job.id, |job| job.set_state(JobState::Executing))?;
                self.publish(&job);
                job
            } else {
                tracing::info!(job_id = %job.id, "Resuming job left executing by a previous run");
                job
            };

            let cancel = admission.start(job.id);
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.drive(job, cancel).await });
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Task body for one executing job.
    async fn drive(self: Arc<Self>, job: Job, cancel: CancellationToken) {
        let id = job.id;
        tracing::info!(
            job_id = %id,
            content_id = %job.content_id,
            rep_factor = job.storage_config.rep_factor,
            "Executing job"
        );

        let verdict = tokio::select! {
            biased;
            _ = self.stopping.cancelled() => {
                tracing::info!(job_id = %id, "Abandoning job for shutdown");
                self.admission.lock().await.finish(&id);
                return;
            }
            _ = cancel.cancelled() => Verdict::canceled(),
            verdict = self.execute(&job, &cancel) => verdict,
        };

        self.admission.lock().await.begin_commit(&id);
        self.commit(id, verdict).await;
        self.admission.lock().await.finish(&id);
        self.wake.notify_one();
    }

    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> Verdict {
        let rep_factor = job.storage_config.rep_factor;
        let miners = match self
            .selector
            .get_miners(rep_factor, &job.storage_config.filter())
        {
            Ok(miners) => miners,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Miner selection failed");
                return Verdict::failed(format!("selecting miners: {}", e));
            }
        };

        let outcome = self
            .executor
            .execute(
                job.id,
                &job.content_id,
                &job.storage_config,
                &miners,
                cancel,
            )
            .await;

        let succeeded = outcome.deals.len();
        let (state, cause) = if outcome.canceled {
            (JobState::Canceled, None)
        } else if succeeded >= rep_factor {
            (JobState::Success, None)
        } else {
            (
                JobState::Failed,
                Some(format!(
                    "only {} of {} required deals succeeded",
                    succeeded, rep_factor
                )),
            )
        };
        Verdict {
            state,
            cause,
            deals: outcome.deals,
            errors: outcome.errors,
        }
    }

    /// Commit a job's terminal state, retrying persistence failures until it
    /// lands or the scheduler stops.
    async fn commit(&self, id: JobId, verdict: Verdict) {
        loop {
            let attempt = verdict.clone();
            match self.store.transition(&id, |job| attempt.apply(job)) {
                Ok(job) => {
                    match &job.err_cause {
                        Some(cause) => tracing::info!(
                            job_id = %id,
                            state = %job.state,
                            deal_errors = job.deal_errors.len(),
                            cause = %cause,
                            "Job finished"
                        ),
                        None => tracing::info!(
                            job_id = %id,
                            state = %job.state,
                            deals = job.deals.len(),
                            "Job finished"
                        ),
                    }
                    self.publish(&job);
                    return;
                }
                Err(SchedulerError::AlreadyTerminal { state, .. }) => {
                    tracing::warn!(job_id = %id, state = %state, "Job already finished");
                    return;
                }
                Err(SchedulerError::Persistence(e)) => {
                    tracing::warn!(job_id = %id, error = %e, "Failed to persist job result, retrying");
                    tokio::select! {
                        _ = self.stopping.cancelled() => return,
                        _ = tokio::time::sleep(self.config.persist_retry_interval()) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Job result rejected");
                    return;
                }
            }
        }
    }
}
