use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempo_core::store::{JobStore, TriggerStore};
use tempo_core::{LockManager, MemoryLockManager, MemoryStore};
use tempo_model::{ErrorClass, HolderId, Job, JobOrigin, JobState};

mod common;

use common::{Harness, eventually, interval_trigger, manual_trigger, register_flaky};

const WAIT: Duration = Duration::from_secs(5);

/// A job left `running` by a worker that died mid-execution.
async fn abandoned_job(h: &Harness, trigger_id: tempo_model::TriggerId, holder: &str) -> Job {
    let mut job = Job::new(
        trigger_id,
        JobOrigin::Schedule,
        Utc::now() - chrono::Duration::minutes(5),
        3,
        Duration::from_millis(100),
    );
    h.store.insert_job(&job).await.unwrap();
    job.start(HolderId::new(holder), Utc::now() - chrono::Duration::minutes(5))
        .unwrap();
    h.store.update_job(&job).await.unwrap();
    job
}

#[tokio::test]
async fn sweep_fails_orphans_and_schedules_retry() {
    let h = Harness::new("worker-sweeper");
    let trigger = manual_trigger("report");
    let trigger_id = trigger.id;
    h.store.upsert_trigger(trigger).await;
    let orphan = abandoned_job(&h, trigger_id, "dead-worker").await;

    let report = h.engine.reconcile_now().await.unwrap();
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.retries.len(), 1);

    let failed = h.store.get_job(orphan.id).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.error.expect("error").class, ErrorClass::Orphaned);

    let retry = &report.retries[0];
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.previous_job_id, Some(orphan.id));
    assert_eq!(retry.state, JobState::Pending);

    // A second sweep finds nothing left to recover.
    assert_eq!(h.engine.reconcile_now().await.unwrap().orphaned, 0);
}

#[tokio::test]
async fn sweep_leaves_jobs_whose_holder_still_heartbeats() {
    let h = Harness::new("worker-sweeper");
    let trigger = manual_trigger("report");
    let trigger_id = trigger.id;
    h.store.upsert_trigger(trigger).await;
    let job = abandoned_job(&h, trigger_id, "slow-but-alive").await;
    h.locks
        .acquire(
            &trigger_id.resource_id(),
            &HolderId::new("slow-but-alive"),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let report = h.engine.reconcile_now().await.unwrap();
    assert_eq!(report.orphaned, 0);
    let stored = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Running);
}

#[tokio::test]
async fn sweep_sees_through_restarted_worker_with_same_id() {
    let h = Harness::new("worker-sweeper");
    let trigger = manual_trigger("report");
    let trigger_id = trigger.id;
    h.store.upsert_trigger(trigger).await;
    let resource = trigger_id.resource_id();
    let holder = HolderId::new("worker-fixed-id");
    let long_ago = Utc::now() - chrono::Duration::minutes(5);

    // First incarnation starts a job under its lease, then dies.
    let old_lease = h
        .locks
        .acquire(&resource, &holder, Duration::from_secs(30))
        .await
        .unwrap()
        .into_lock()
        .expect("lock is free");
    let mut job = Job::new(
        trigger_id,
        JobOrigin::Schedule,
        long_ago,
        3,
        Duration::from_millis(100),
    );
    h.store.insert_job(&job).await.unwrap();
    job.start_under(&old_lease, long_ago).unwrap();
    h.store.update_job(&job).await.unwrap();
    h.locks.release(&old_lease).await.unwrap();

    // The restarted process reuses the worker id but holds a fresh lease.
    let new_lease = h
        .locks
        .acquire(&resource, &holder, Duration::from_secs(30))
        .await
        .unwrap()
        .into_lock()
        .expect("lock is free");
    assert_ne!(new_lease.lease_id, old_lease.lease_id);

    let report = h.engine.reconcile_now().await.unwrap();
    assert_eq!(report.orphaned, 1);
    let stored = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.error.expect("error").class, ErrorClass::Orphaned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovered_orphan_runs_again_to_completion() {
    let h = Harness::new("worker-recovering");
    register_flaky(&h.handlers, "report", 0);
    let trigger = manual_trigger("report");
    let trigger_id = trigger.id;
    h.store.upsert_trigger(trigger).await;
    let orphan = abandoned_job(&h, trigger_id, "dead-worker").await;

    h.engine.start().await.unwrap();
    let retry = eventually(WAIT, || async {
        h.store
            .jobs_for(trigger_id)
            .await
            .into_iter()
            .find(|job| job.previous_job_id == Some(orphan.id) && job.is_terminal())
    })
    .await;
    h.engine.shutdown().await;

    assert_eq!(retry.state, JobState::Completed);
    assert_eq!(retry.attempt, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_picks_up_due_triggers_and_pending_attempts() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLockManager::new());

    let missed = interval_trigger("report", 60, Utc::now() - chrono::Duration::minutes(3));
    let missed_id = missed.id;
    store.upsert_trigger(missed).await;

    let other = manual_trigger("report");
    let other_id = other.id;
    store.upsert_trigger(other).await;
    let pending = Job::new(
        other_id,
        JobOrigin::Manual,
        Utc::now(),
        3,
        Duration::from_secs(1),
    )
    .next_attempt(Utc::now() - chrono::Duration::seconds(1));
    store.insert_job(&pending).await.unwrap();

    // Fresh process: nothing in memory, everything comes from the store.
    let h = Harness::with_backends(store, locks, common::fast_config("worker-restarted"));
    register_flaky(&h.handlers, "report", 0);
    h.engine.start().await.unwrap();

    eventually(WAIT, || async {
        let missed_done = h
            .store
            .jobs_for(missed_id)
            .await
            .iter()
            .any(|job| job.state == JobState::Completed);
        let pending_done = h
            .store
            .get_job(pending.id)
            .await
            .unwrap()
            .is_some_and(|job| job.state == JobState::Completed);
        (missed_done && pending_done).then_some(())
    })
    .await;
    h.engine.shutdown().await;

    // Missed firings are not replayed; the schedule moves past now.
    assert_eq!(h.store.jobs_for(missed_id).await.len(), 1);
    let trigger = h.store.get_trigger(missed_id).await.unwrap().unwrap();
    assert!(trigger.next_due_at.expect("recurring") > Utc::now());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_outage_delays_but_does_not_lose_work() {
    let h = Harness::new("worker-outage");
    register_flaky(&h.handlers, "report", 0);
    let trigger = interval_trigger("report", 60, Utc::now());
    let trigger_id = trigger.id;
    h.store.upsert_trigger(trigger).await;

    h.store.set_unavailable(true);
    h.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.jobs_for(trigger_id).await.is_empty());
    h.store.set_unavailable(false);

    let job = eventually(WAIT, || async {
        h.store
            .jobs_for(trigger_id)
            .await
            .into_iter()
            .find(|job| job.is_terminal())
    })
    .await;
    h.engine.shutdown().await;
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_workers_never_run_the_same_firing_twice() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLockManager::new());
    let a = Harness::with_backends(
        Arc::clone(&store),
        Arc::clone(&locks),
        common::fast_config("worker-a"),
    );
    let b = Harness::with_backends(
        Arc::clone(&store),
        Arc::clone(&locks),
        common::fast_config("worker-b"),
    );
    register_flaky(&a.handlers, "tick", 0);
    register_flaky(&b.handlers, "tick", 0);

    let trigger = interval_trigger("tick", 1, Utc::now());
    let trigger_id = trigger.id;
    store.upsert_trigger(trigger).await;

    a.engine.start().await.unwrap();
    b.engine.start().await.unwrap();
    let jobs = eventually(Duration::from_secs(10), || async {
        let jobs = store.jobs_for(trigger_id).await;
        (jobs.iter().filter(|job| job.state == JobState::Completed).count() >= 3)
            .then_some(jobs)
    })
    .await;
    a.engine.shutdown().await;
    b.engine.shutdown().await;

    let firings: HashSet<_> = jobs.iter().map(|job| job.scheduled_for).collect();
    assert_eq!(firings.len(), jobs.len(), "a firing ran more than once");

    // Due times only ever move forward.
    let mut due_times: Vec<_> = jobs.iter().map(|job| job.scheduled_for).collect();
    let in_creation_order = due_times.clone();
    due_times.sort();
    assert_eq!(due_times, in_creation_order);
    let trigger = store.get_trigger(trigger_id).await.unwrap().unwrap();
    assert!(trigger.next_due_at.expect("recurring") > *due_times.last().expect("ran"));
}
