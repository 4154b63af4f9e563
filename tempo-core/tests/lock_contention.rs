use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tempo_core::store::{MemoryStore, TriggerStore};
use tempo_core::{Acquire, LockManager, MemoryLockManager};
use tempo_model::{HolderId, ResourceId, TriggerId};

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_yield_one_holder() {
    let locks = Arc::new(MemoryLockManager::new());
    let resource = ResourceId("trigger:contended".into());

    let mut handles = Vec::new();
    for worker in 0..32 {
        let locks = Arc::clone(&locks);
        let resource = resource.clone();
        handles.push(tokio::spawn(async move {
            locks
                .acquire(
                    &resource,
                    &HolderId::new(format!("w{worker}")),
                    Duration::from_secs(30),
                )
                .await
                .expect("acquire")
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if matches!(handle.await.expect("join"), Acquire::Acquired(_)) {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn lock_heals_after_holder_stops_heartbeating() {
    let locks = MemoryLockManager::new();
    let resource = ResourceId("trigger:crashed".into());

    let first = locks
        .acquire(&resource, &HolderId::new("crashed"), Duration::from_millis(50))
        .await
        .unwrap()
        .into_lock()
        .expect("first holder");
    assert_eq!(
        locks
            .acquire(&resource, &HolderId::new("next"), Duration::from_secs(30))
            .await
            .unwrap(),
        Acquire::Denied
    );

    tokio::time::sleep(Duration::from_millis(80)).await;
    let second = locks
        .acquire(&resource, &HolderId::new("next"), Duration::from_secs(30))
        .await
        .unwrap()
        .into_lock()
        .expect("lock available after ttl");

    // The crashed holder waking up must not disturb its successor.
    assert!(!locks.release(&first).await.unwrap());
    let current = locks.inspect(&resource).await.unwrap().expect("still held");
    assert!(current.same_lease(&second));
}

/// Lock plus due-time compare-and-set, raced by two workers each round:
/// exactly one of them may claim a firing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_workers_claim_each_firing_once() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLockManager::new());
    let start = Utc::now() - chrono::Duration::hours(1);
    let trigger = common::interval_trigger("noop", 1, start);
    let trigger_id: TriggerId = trigger.id;
    store.upsert_trigger(trigger).await;

    let claims = Arc::new(AtomicUsize::new(0));
    for round in 0..1_000i64 {
        let due = start + chrono::Duration::seconds(round);
        let next = due + chrono::Duration::seconds(1);

        let mut racers = Vec::new();
        for worker in ["a", "b"] {
            let store = Arc::clone(&store);
            let locks = Arc::clone(&locks);
            let claims = Arc::clone(&claims);
            racers.push(tokio::spawn(async move {
                let resource = trigger_id.resource_id();
                let Some(lock) = locks
                    .acquire(&resource, &HolderId::new(worker), Duration::from_secs(5))
                    .await
                    .unwrap()
                    .into_lock()
                else {
                    return;
                };
                if store
                    .advance_next_due(trigger_id, due, Some(next))
                    .await
                    .unwrap()
                {
                    claims.fetch_add(1, Ordering::SeqCst);
                }
                locks.release(&lock).await.unwrap();
            }));
        }
        for racer in racers {
            racer.await.expect("join");
        }
        assert_eq!(
            claims.load(Ordering::SeqCst),
            (round + 1) as usize,
            "round {round} claimed more or less than once"
        );
    }
}
