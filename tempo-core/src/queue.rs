//! Hybrid scheduling queue: an in-memory min-heap fed from the durable store.
//!
//! The heap is never the source of truth. Due triggers and pending retry
//! attempts are re-read from the store on every poll and on recovery, so a
//! restart loses no execution intent. Entries are deduplicated while queued
//! or in flight, which keeps repeated polls from offering the same firing
//! twice to this worker.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempo_model::{Job, JobId, Trigger, TriggerId};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::store::{JobStore, TriggerStore};

/// What a queued entry asks the engine to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkKind {
    /// Regular firing at the trigger's `next_due_at`.
    Scheduled,
    /// External signal for an event-driven trigger.
    Signal,
    /// Persisted pending attempt (a retry).
    Attempt(JobId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkKey {
    Trigger(TriggerId),
    Job(JobId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub trigger_id: TriggerId,
    pub due_at: DateTime<Utc>,
    pub priority: i32,
    pub kind: WorkKind,
}

impl WorkItem {
    pub fn scheduled(trigger: &Trigger) -> Option<Self> {
        trigger.next_due_at.map(|due_at| Self {
            trigger_id: trigger.id,
            due_at,
            priority: trigger.priority,
            kind: WorkKind::Scheduled,
        })
    }

    pub fn signal(trigger: &Trigger, at: DateTime<Utc>) -> Self {
        Self {
            trigger_id: trigger.id,
            due_at: at,
            priority: trigger.priority,
            kind: WorkKind::Signal,
        }
    }

    pub fn attempt(job: &Job) -> Self {
        Self {
            trigger_id: job.trigger_id,
            due_at: job.runnable_at(),
            priority: job.priority,
            kind: WorkKind::Attempt(job.id),
        }
    }

    pub fn key(&self) -> WorkKey {
        match self.kind {
            WorkKind::Scheduled | WorkKind::Signal => WorkKey::Trigger(self.trigger_id),
            WorkKind::Attempt(job_id) => WorkKey::Job(job_id),
        }
    }
}

/// Heap ordering: earliest due first, then higher priority, then trigger id.
#[derive(Debug, PartialEq, Eq)]
struct Entry(WorkItem);

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest element, so due time and trigger id
        // compare reversed.
        other
            .0
            .due_at
            .cmp(&self.0.due_at)
            .then_with(|| self.0.priority.cmp(&other.0.priority))
            .then_with(|| other.0.trigger_id.cmp(&self.0.trigger_id))
            .then_with(|| other.0.kind.cmp(&self.0.kind))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    queued: HashSet<WorkKey>,
    in_flight: HashSet<WorkKey>,
}

impl QueueState {
    fn push(&mut self, item: WorkItem) -> bool {
        let key = item.key();
        if self.queued.contains(&key) || self.in_flight.contains(&key) {
            return false;
        }
        self.queued.insert(key);
        self.heap.push(Entry(item));
        true
    }
}

/// Counts reported by a poll.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fetched: usize,
    pub enqueued: usize,
}

pub struct SchedulingQueue {
    triggers: Arc<dyn TriggerStore>,
    jobs: Arc<dyn JobStore>,
    batch_limit: usize,
    state: Mutex<QueueState>,
}

impl fmt::Debug for SchedulingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SchedulingQueue");
        debug.field("batch_limit", &self.batch_limit);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("queued", &state.heap.len())
                    .field("in_flight", &state.in_flight.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl SchedulingQueue {
    pub fn new(
        triggers: Arc<dyn TriggerStore>,
        jobs: Arc<dyn JobStore>,
        batch_limit: usize,
    ) -> Self {
        Self {
            triggers,
            jobs,
            batch_limit: batch_limit.max(1),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Reads active triggers due at `now` and queues the ones not already
    /// queued or running here. Returns every trigger the store reported.
    pub async fn poll_due_triggers(&self, now: DateTime<Utc>) -> Result<Vec<Trigger>> {
        Ok(self.queue_due_triggers(now).await?.0)
    }

    async fn queue_due_triggers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Trigger>, usize)> {
        let due = self
            .triggers
            .list_active_triggers_due_before(now, self.batch_limit)
            .await?;
        let mut state = self.state.lock().await;
        let mut enqueued = 0usize;
        for trigger in &due {
            if let Some(item) = WorkItem::scheduled(trigger)
                && state.push(item)
            {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            debug!(
                target: "tempo::queue",
                fetched = due.len(),
                enqueued,
                depth = state.heap.len(),
                "queued due triggers"
            );
        }
        Ok((due, enqueued))
    }

    /// Queues persisted pending attempts that became runnable.
    pub async fn poll_pending_attempts(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        let pending = self.jobs.list_pending_due(now, self.batch_limit).await?;
        let mut state = self.state.lock().await;
        let mut summary = PollSummary {
            fetched: pending.len(),
            enqueued: 0,
        };
        for job in &pending {
            if state.push(WorkItem::attempt(job)) {
                summary.enqueued += 1;
            }
        }
        Ok(summary)
    }

    /// One full poll cycle over triggers and pending attempts.
    pub async fn poll(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        let (due, enqueued) = self.queue_due_triggers(now).await?;
        let attempts = self.poll_pending_attempts(now).await?;
        Ok(PollSummary {
            fetched: due.len() + attempts.fetched,
            enqueued: enqueued + attempts.enqueued,
        })
    }

    /// Pops the head if it is due at `now`. The entry stays tracked as in
    /// flight until [`mark_done`](Self::mark_done).
    pub async fn dequeue_ready(&self, now: DateTime<Utc>) -> Option<WorkItem> {
        let mut state = self.state.lock().await;
        if state.heap.peek().is_none_or(|head| head.0.due_at > now) {
            return None;
        }
        let Entry(item) = state.heap.pop()?;
        let key = item.key();
        state.queued.remove(&key);
        state.in_flight.insert(key);
        trace!(target: "tempo::queue", trigger = %item.trigger_id, kind = ?item.kind, "dequeued");
        Some(item)
    }

    /// Adds an item outside the poll cycle (signals, freshly scheduled
    /// retries). Returns `false` when it is already queued or running.
    pub async fn push(&self, item: WorkItem) -> bool {
        self.state.lock().await.push(item)
    }

    /// Forgets an in-flight entry so later polls may queue it again.
    pub async fn mark_done(&self, key: WorkKey) {
        self.state.lock().await.in_flight.remove(&key);
    }

    /// Drops the in-memory heap and rebuilds it from the store. In-flight
    /// entries stay tracked; their executions are still running.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        {
            let mut state = self.state.lock().await;
            state.heap.clear();
            state.queued.clear();
        }
        let summary = self.poll(now).await?;
        debug!(
            target: "tempo::queue",
            fetched = summary.fetched,
            enqueued = summary.enqueued,
            "queue rebuilt from store"
        );
        Ok(summary)
    }

    pub async fn depth(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::store::{MemoryStore, MockJobStore, MockTriggerStore};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempo_model::{ExecutionSpec, IntervalUnit, ScheduleSpec};

    fn trigger(due: DateTime<Utc>, priority: i32) -> Trigger {
        Trigger::new(
            "owner",
            ScheduleSpec::Interval {
                every: 60,
                unit: IntervalUnit::Seconds,
            },
            ExecutionSpec {
                task_type: "noop".into(),
                payload: json!({}),
                max_duration_ms: 1_000,
                retry_policy: None,
            },
        )
        .with_priority(priority)
        .with_next_due(due)
    }

    fn queue_over(store: &MemoryStore) -> SchedulingQueue {
        SchedulingQueue::new(Arc::new(store.clone()), Arc::new(store.clone()), 100)
    }

    #[tokio::test]
    async fn dequeues_in_due_then_priority_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let later = trigger(now - ChronoDuration::seconds(1), 0);
        let low = trigger(now - ChronoDuration::seconds(10), 1);
        let high = trigger(now - ChronoDuration::seconds(10), 5);
        for t in [&later, &low, &high] {
            store.upsert_trigger(t.clone()).await;
        }
        let queue = queue_over(&store);

        queue.poll_due_triggers(now).await.unwrap();
        let order: Vec<TriggerId> = [
            queue.dequeue_ready(now).await,
            queue.dequeue_ready(now).await,
            queue.dequeue_ready(now).await,
        ]
        .into_iter()
        .flatten()
        .map(|item| item.trigger_id)
        .collect();
        assert_eq!(order, vec![high.id, low.id, later.id]);
        assert!(queue.dequeue_ready(now).await.is_none());
    }

    #[tokio::test]
    async fn retry_attempts_keep_trigger_priority() {
        let store = MemoryStore::new();
        let queue = queue_over(&store);
        let now = Utc::now();
        let retry_at = now - ChronoDuration::seconds(1);
        let attempt = |priority: i32| {
            Job::new(
                TriggerId::new(),
                tempo_model::JobOrigin::Schedule,
                now,
                3,
                std::time::Duration::from_secs(1),
            )
            .with_priority(priority)
            .next_attempt(retry_at)
        };
        let low = attempt(1);
        let high = attempt(9);
        queue.push(WorkItem::attempt(&low)).await;
        queue.push(WorkItem::attempt(&high)).await;

        let first = queue.dequeue_ready(now).await.expect("due");
        assert_eq!(first.kind, WorkKind::Attempt(high.id));
        assert_eq!(first.priority, 9);
    }

    #[tokio::test]
    async fn future_head_is_not_dequeued() {
        let store = MemoryStore::new();
        let queue = queue_over(&store);
        let now = Utc::now();
        let t = trigger(now + ChronoDuration::seconds(30), 0);
        assert!(queue.push(WorkItem::scheduled(&t).unwrap()).await);

        assert!(queue.dequeue_ready(now).await.is_none());
        assert!(
            queue
                .dequeue_ready(now + ChronoDuration::seconds(31))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn repeated_polls_do_not_duplicate_entries() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let t = trigger(now - ChronoDuration::seconds(1), 0);
        store.upsert_trigger(t.clone()).await;
        let queue = queue_over(&store);

        queue.poll_due_triggers(now).await.unwrap();
        queue.poll_due_triggers(now).await.unwrap();
        assert_eq!(queue.depth().await, 1);

        let item = queue.dequeue_ready(now).await.expect("due");
        // Still in flight: a poll must not re-offer it.
        queue.poll_due_triggers(now).await.unwrap();
        assert_eq!(queue.depth().await, 0);

        queue.mark_done(item.key()).await;
        queue.poll_due_triggers(now).await.unwrap();
        assert_eq!(queue.depth().await, 1);
    }

    #[tokio::test]
    async fn recover_rebuilds_from_store() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let kept = trigger(now - ChronoDuration::seconds(5), 0);
        store.upsert_trigger(kept.clone()).await;
        let queue = queue_over(&store);

        // Something that only ever lived in memory disappears.
        let ghost = trigger(now, 0);
        queue.push(WorkItem::scheduled(&ghost).unwrap()).await;

        let summary = queue.recover(now).await.unwrap();
        assert_eq!(summary.enqueued, 1);
        let item = queue.dequeue_ready(now).await.expect("recovered");
        assert_eq!(item.trigger_id, kept.id);
        assert!(queue.dequeue_ready(now).await.is_none());
    }

    #[tokio::test]
    async fn unavailable_store_skips_cycle_without_touching_heap() {
        let now = Utc::now();
        let t = trigger(now - ChronoDuration::seconds(1), 0);
        let due = t.clone();

        let mut triggers = MockTriggerStore::new();
        let mut calls = 0;
        triggers
            .expect_list_active_triggers_due_before()
            .times(2)
            .returning(move |_, _| {
                calls += 1;
                if calls == 1 {
                    Err(EngineError::store("list due triggers", "connection refused"))
                } else {
                    Ok(vec![due.clone()])
                }
            });
        let jobs = MockJobStore::new();
        let queue = SchedulingQueue::new(Arc::new(triggers), Arc::new(jobs), 10);

        let err = queue.poll_due_triggers(now).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(queue.depth().await, 0);

        queue.poll_due_triggers(now).await.unwrap();
        assert_eq!(queue.depth().await, 1);
    }
}
