
use std::sync::Arc;
use std::time::{Duration, Instant};

use deal_scheduler::deals::{DevnetConfig, DevnetNegotiator};
use deal_scheduler::scheduler::{ContentId, JobId, JobState, StorageConfig};
use deal_scheduler::store::{JobStore, StoreError};
use deal_scheduler::SchedulerError;
use test_harness::{
    assert_eventually, mem_store, miner_pool, test_config, wait_for_state, FlakyDatastore, Reply,
    ScriptedNegotiator, TestScheduler,
};

const WAIT: Duration = Duration::from_secs(5);

fn cid(n: usize) -> ContentId {
    ContentId::new(format!("bafy-content-{n}"))
}

#[tokio::test]
async fn test_job_succeeds_with_enough_deals() {
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::from_millis(10)));
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(3), negotiator.clone());

    let id = ts
        .scheduler
        .submit(cid(1), StorageConfig::default().with_rep_factor(2))
        .await
        .unwrap();
    let job = wait_for_state(&ts.scheduler, &id, JobState::Success, WAIT)
        .await
        .expect("job should succeed");

    assert_eq!(job.deals.len(), 2);
    assert!(job.err_cause.is_none());
    assert!(job.deal_errors.is_empty());
    // Exactly rep_factor miners are asked.
    assert_eq!(negotiator.calls(), 2);
    ts.stop().await;
}

#[tokio::test]
async fn test_trusted_miner_is_used_first() {
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::ZERO));
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(3), negotiator.clone());

    let id = ts
        .scheduler
        .submit(cid(1), StorageConfig::default().with_trusted_miner("f01002"))
        .await
        .unwrap();
    let job = wait_for_state(&ts.scheduler, &id, JobState::Success, WAIT)
        .await
        .unwrap();

    assert_eq!(job.deals[0].miner, "f01002");
    assert_eq!(negotiator.proposed(), vec!["f01002".to_string()]);
    ts.stop().await;
}

#[tokio::test]
async fn test_oversized_payload_fails_with_one_deal_error() {
    let negotiator = Arc::new(DevnetNegotiator::new(DevnetConfig {
        sector_size: 2048,
        min_latency_ms: 0,
        max_latency_ms: 5,
        ..Default::default()
    }));
    negotiator.register_content(cid(1), 4096);
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(3), negotiator);

    let id = ts
        .scheduler
        .submit(cid(1), StorageConfig::default().with_rep_factor(1))
        .await
        .unwrap();
    let job = wait_for_state(&ts.scheduler, &id, JobState::Failed, WAIT)
        .await
        .expect("job should fail");

    assert_eq!(job.deal_errors.len(), 1);
    assert_eq!(job.deal_errors[0].message, "data doesn't fit in a sector");
    assert_eq!(job.deal_errors[0].proposal_cid, None);
    assert_eq!(job.deal_errors[0].miner, "f01000");
    assert!(job.deals.is_empty());
    assert!(job.err_cause.is_some());
    ts.stop().await;
}

#[tokio::test]
async fn test_partial_success_fails_and_keeps_deals() {
    let negotiator = Arc::new(
        ScriptedNegotiator::accepting(Duration::ZERO).script("f01001", Reply::reject("no capacity")),
    );
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(2), negotiator.clone());

    let id = ts
        .scheduler
        .submit(cid(1), StorageConfig::default().with_rep_factor(2))
        .await
        .unwrap();
    let job = wait_for_state(&ts.scheduler, &id, JobState::Failed, WAIT)
        .await
        .expect("job should fail short of rep_factor");

    assert_eq!(job.err_cause.as_deref(), Some("only 1 of 2 required deals succeeded"));
    assert_eq!(job.deals.len(), 1);
    assert_eq!(job.deals[0].miner, "f01000");
    assert_eq!(job.deals[0].proposal_cid, "prop-f01000");
    assert_eq!(job.deal_errors.len(), 1);
    assert_eq!(job.deal_errors[0].miner, "f01001");
    assert_eq!(job.deal_errors[0].message, "no capacity");
    assert_eq!(job.deal_errors[0].proposal_cid, None);
    assert_eq!(negotiator.calls(), 2);
    ts.stop().await;
}

#[tokio::test]
async fn test_rejected_proposal_cid_is_recorded() {
    let rejected = Reply::Reject {
        proposal_cid: Some("bafyprop-rejected".to_string()),
        message: "deal rejected: price too low".to_string(),
    };
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::ZERO).script("f01000", rejected));
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(1), negotiator);

    let id = ts.scheduler.submit(cid(1), StorageConfig::default()).await.unwrap();
    wait_for_state(&ts.scheduler, &id, JobState::Failed, WAIT)
        .await
        .unwrap();

    // Read back through the store, not just the in-flight view.
    let job = ts.scheduler.status(&id).unwrap();
    assert_eq!(job.deal_errors.len(), 1);
    assert_eq!(job.deal_errors[0].proposal_cid.as_deref(), Some("bafyprop-rejected"));
    assert_eq!(job.deal_errors[0].message, "deal rejected: price too low");
    assert!(job.deals.is_empty());
    ts.stop().await;
}

#[tokio::test]
async fn test_selection_failure_fails_job() {
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::ZERO));
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(1), negotiator.clone());

    let id = ts
        .scheduler
        .submit(cid(1), StorageConfig::default().with_rep_factor(2))
        .await
        .unwrap();
    let job = wait_for_state(&ts.scheduler, &id, JobState::Failed, WAIT)
        .await
        .unwrap();

    assert_eq!(
        job.err_cause.as_deref(),
        Some("selecting miners: not enough miners to provide, want 2, got 1")
    );
    assert!(job.deal_errors.is_empty());
    assert_eq!(negotiator.calls(), 0);
    ts.stop().await;
}

#[tokio::test]
async fn test_cancel_executing_job_is_prompt() {
    let negotiator = Arc::new(ScriptedNegotiator::hanging());
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(3), negotiator.clone());

    let id = ts
        .scheduler
        .submit(cid(1), StorageConfig::default().with_rep_factor(3))
        .await
        .unwrap();
    wait_for_state(&ts.scheduler, &id, JobState::Executing, WAIT)
        .await
        .unwrap();
    let scheduler = ts.scheduler.clone();
    assert_eventually(
        || {
            let negotiator = negotiator.clone();
            async move { negotiator.calls() == 3 }
        },
        WAIT,
        "negotiations should start",
    )
    .await;

    let start = Instant::now();
    scheduler.cancel(&id).await.unwrap();
    let job = wait_for_state(&scheduler, &id, JobState::Canceled, Duration::from_secs(1))
        .await
        .expect("cancel should land within a second");
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(job.deals.is_empty());

    assert_eventually(
        || {
            let scheduler = scheduler.clone();
            async move { scheduler.running_jobs().await.is_empty() }
        },
        WAIT,
        "slot should be released",
    )
    .await;
    ts.stop().await;
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let negotiator = Arc::new(ScriptedNegotiator::hanging());
    let ts = TestScheduler::start(test_config(1), mem_store(), miner_pool(3), negotiator);

    let first = ts.scheduler.submit(cid(1), StorageConfig::default()).await.unwrap();
    wait_for_state(&ts.scheduler, &first, JobState::Executing, WAIT)
        .await
        .unwrap();
    let second = ts.scheduler.submit(cid(2), StorageConfig::default()).await.unwrap();

    ts.scheduler.cancel(&second).await.unwrap();
    assert_eq!(ts.scheduler.status(&second).unwrap().state, JobState::Canceled);
    assert_eq!(ts.scheduler.status(&first).unwrap().state, JobState::Executing);
    ts.stop().await;
}

#[tokio::test]
async fn test_cancel_finished_job_is_noop() {
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::ZERO));
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(1), negotiator);

    let id = ts.scheduler.submit(cid(1), StorageConfig::default()).await.unwrap();
    let done = wait_for_state(&ts.scheduler, &id, JobState::Success, WAIT)
        .await
        .unwrap();

    ts.scheduler.cancel(&id).await.unwrap();
    assert_eq!(ts.scheduler.status(&id).unwrap(), done);
    ts.stop().await;
}

#[tokio::test]
async fn test_cancel_unknown_job() {
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::ZERO));
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(1), negotiator);

    let err = ts.scheduler.cancel(&JobId::new()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound(_)));
    ts.stop().await;
}

#[tokio::test]
async fn test_jobs_execute_in_parallel() {
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::from_millis(300)));
    let ts = TestScheduler::start(test_config(5), mem_store(), miner_pool(1), negotiator.clone());

    let start = Instant::now();
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(ts.scheduler.submit(cid(n), StorageConfig::default()).await.unwrap());
    }
    for id in &ids {
        wait_for_state(&ts.scheduler, id, JobState::Success, WAIT)
            .await
            .expect("job should succeed");
    }

    // Run one at a time this would take 1.5s.
    assert!(start.elapsed() < Duration::from_millis(1200));
    assert_eq!(negotiator.peak_in_flight(), 5);
    ts.stop().await;
}

#[tokio::test]
async fn test_admission_is_fifo_and_capped() {
    let negotiator = Arc::new(ScriptedNegotiator::hanging());
    let ts = TestScheduler::start(test_config(2), mem_store(), miner_pool(1), negotiator);

    let mut ids = Vec::new();
    for n in 0..4 {
        ids.push(ts.scheduler.submit(cid(n), StorageConfig::default()).await.unwrap());
    }
    wait_for_state(&ts.scheduler, &ids[0], JobState::Executing, WAIT).await.unwrap();
    wait_for_state(&ts.scheduler, &ids[1], JobState::Executing, WAIT).await.unwrap();

    // Give the loop a few ticks to overshoot if it were going to.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let executing = ts.scheduler.list_jobs(Some(JobState::Executing)).unwrap();
    assert_eq!(executing.len(), 2);
    assert_eq!(ts.scheduler.running_jobs().await.len(), 2);
    let queued: Vec<JobId> = ts
        .scheduler
        .list_jobs(Some(JobState::Queued))
        .unwrap()
        .iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(queued, ids[2..].to_vec());

    // Freeing a slot admits the oldest queued job.
    ts.scheduler.cancel(&ids[0]).await.unwrap();
    wait_for_state(&ts.scheduler, &ids[2], JobState::Executing, WAIT)
        .await
        .expect("third job should be admitted");
    assert_eq!(ts.scheduler.status(&ids[3]).unwrap().state, JobState::Queued);
    ts.stop().await;
}

#[tokio::test]
async fn test_restart_resumes_unfinished_jobs() {
    let store = mem_store();
    let hanging = Arc::new(ScriptedNegotiator::hanging());
    let first = TestScheduler::start(test_config(1), store.clone(), miner_pool(2), hanging);

    let executing = first.scheduler.submit(cid(1), StorageConfig::default()).await.unwrap();
    wait_for_state(&first.scheduler, &executing, JobState::Executing, WAIT)
        .await
        .unwrap();
    let queued = first.scheduler.submit(cid(2), StorageConfig::default()).await.unwrap();
    let canceled = first.scheduler.submit(cid(3), StorageConfig::default()).await.unwrap();
    first.scheduler.cancel(&canceled).await.unwrap();

    // Copy the store while the first scheduler still holds the job, as a crash would leave it.
    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.get(&executing).unwrap().unwrap().state, JobState::Executing);
    assert_eq!(snapshot.get(&queued).unwrap().unwrap().state, JobState::Queued);
    assert_eq!(snapshot.get(&canceled).unwrap().unwrap().state, JobState::Canceled);
    first.stop().await;

    let accepting = Arc::new(ScriptedNegotiator::accepting(Duration::ZERO));
    let second = TestScheduler::start(test_config(1), snapshot, miner_pool(2), accepting.clone());
    for id in [executing, queued] {
        wait_for_state(&second.scheduler, &id, JobState::Success, WAIT)
            .await
            .expect("unfinished job should be resumed");
    }
    assert_eq!(second.scheduler.status(&canceled).unwrap().state, JobState::Canceled);
    // The canceled job is never negotiated.
    assert_eq!(accepting.calls(), 2);
    second.stop().await;
}

#[tokio::test]
async fn test_submit_surfaces_persistence_failure() {
    let ds = Arc::new(FlakyDatastore::new());
    ds.set_failing(true);
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::ZERO));
    let ts = TestScheduler::start(test_config(4), JobStore::new(ds), miner_pool(1), negotiator);

    let err = ts
        .scheduler
        .submit(cid(1), StorageConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Persistence(StoreError::Unavailable(_))));
    assert!(ts.scheduler.list_jobs(None).unwrap().is_empty());
    ts.stop().await;
}

#[tokio::test]
async fn test_terminal_commit_is_retried() {
    let ds = Arc::new(FlakyDatastore::new());
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::from_millis(200)));
    let ts = TestScheduler::start(
        test_config(4),
        JobStore::new(ds.clone()),
        miner_pool(1),
        negotiator,
    );

    let id = ts.scheduler.submit(cid(1), StorageConfig::default()).await.unwrap();
    wait_for_state(&ts.scheduler, &id, JobState::Executing, WAIT)
        .await
        .unwrap();
    ds.set_failing(true);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(ts.scheduler.status(&id).unwrap().state, JobState::Executing);

    ds.set_failing(false);
    let job = wait_for_state(&ts.scheduler, &id, JobState::Success, WAIT)
        .await
        .expect("commit should land once the store recovers");
    assert_eq!(job.deals.len(), 1);
    ts.stop().await;
}

#[tokio::test]
async fn test_cancel_during_commit_retry_does_not_interrupt() {
    let ds = Arc::new(FlakyDatastore::new());
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::from_millis(50)));
    let ts = TestScheduler::start(
        test_config(4),
        JobStore::new(ds.clone()),
        miner_pool(1),
        negotiator,
    );

    let id = ts.scheduler.submit(cid(1), StorageConfig::default()).await.unwrap();
    wait_for_state(&ts.scheduler, &id, JobState::Executing, WAIT)
        .await
        .unwrap();
    ds.set_failing(true);

    // Negotiation has settled and the verdict is stuck retrying.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ts.scheduler.status(&id).unwrap().state, JobState::Executing);
    ts.scheduler.cancel(&id).await.unwrap();

    ds.set_failing(false);
    let job = wait_for_state(&ts.scheduler, &id, JobState::Success, WAIT)
        .await
        .expect("committed verdict should win over a late cancel");
    assert_eq!(job.deals.len(), 1);
    ts.stop().await;
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::ZERO));
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(1), negotiator);
    ts.scheduler.shutdown();

    let err = ts
        .scheduler
        .submit(cid(1), StorageConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ShuttingDown));
    ts.stop().await;
}

#[tokio::test]
async fn test_invalid_storage_config_is_rejected() {
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::ZERO));
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(1), negotiator);

    let err = ts
        .scheduler
        .submit(cid(1), StorageConfig::default().with_rep_factor(0))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    ts.stop().await;
}

#[tokio::test]
async fn test_watch_sees_each_transition() {
    let negotiator = Arc::new(ScriptedNegotiator::accepting(Duration::from_millis(10)));
    let ts = TestScheduler::start(test_config(4), mem_store(), miner_pool(1), negotiator);
    let mut updates = ts.scheduler.watch();

    let id = ts.scheduler.submit(cid(1), StorageConfig::default()).await.unwrap();
    let mut states = Vec::new();
    while states.last() != Some(&JobState::Success) {
        let job = tokio::time::timeout(WAIT, updates.recv())
            .await
            .expect("update should arrive")
            .unwrap();
        if job.id == id {
            states.push(job.state);
        }
    }
    assert_eq!(
        states,
        vec![JobState::Queued, JobState::Executing, JobState::Success]
    );
    ts.stop().await;
}
