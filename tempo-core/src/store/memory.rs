use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempo_model::{Job, JobId, JobState, ModelError, OutcomeSummary, Trigger, TriggerId};
use tokio::sync::Mutex;

use super::{JobStore, TriggerStore};
use crate::error::{EngineError, Result};

#[derive(Default)]
struct Inner {
    triggers: HashMap<TriggerId, Trigger>,
    jobs: HashMap<JobId, Job>,
}

/// In-process store for tests and single-node deployments.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (triggers, jobs) = match self.inner.try_lock() {
            Ok(inner) => (Some(inner.triggers.len()), Some(inner.jobs.len())),
            Err(_) => (None, None),
        };
        f.debug_struct("MemoryStore")
            .field("triggers", &triggers)
            .field("jobs", &jobs)
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stands in for the external CRUD layer: inserts or replaces a trigger.
    pub async fn upsert_trigger(&self, trigger: Trigger) {
        let mut inner = self.inner.lock().await;
        inner.triggers.insert(trigger.id, trigger);
    }

    /// Makes every call fail with `StoreUnavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every job of a trigger, oldest first.
    pub async fn jobs_for(&self, trigger_id: TriggerId) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.trigger_id == trigger_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        jobs
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::store(operation, "memory store marked unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl TriggerStore for MemoryStore {
    async fn list_active_triggers_due_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>> {
        self.check("list due triggers")?;
        let inner = self.inner.lock().await;
        let mut due: Vec<Trigger> = inner
            .triggers
            .values()
            .filter(|t| t.is_due(before))
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.next_due_at, std::cmp::Reverse(t.priority), t.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn get_trigger(&self, id: TriggerId) -> Result<Option<Trigger>> {
        self.check("get trigger")?;
        Ok(self.inner.lock().await.triggers.get(&id).cloned())
    }

    async fn advance_next_due(
        &self,
        id: TriggerId,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.check("advance next due")?;
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(&id)
            .ok_or(EngineError::TriggerNotFound(id))?;
        if trigger.next_due_at != Some(expected) {
            return Ok(false);
        }
        trigger.next_due_at = next;
        trigger.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_trigger_schedule_state(
        &self,
        id: TriggerId,
        next_due: Option<DateTime<Utc>>,
        last_executed_at: DateTime<Utc>,
        outcome: OutcomeSummary,
    ) -> Result<()> {
        self.check("update trigger schedule state")?;
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(&id)
            .ok_or(EngineError::TriggerNotFound(id))?;
        if let Some(next) = next_due {
            if trigger.next_due_at.is_some_and(|current| next < current) {
                return Err(EngineError::InvalidSchedule(format!(
                    "next due time of trigger {id} may not move backwards"
                )));
            }
            trigger.next_due_at = Some(next);
        }
        trigger.last_executed_at = Some(last_executed_at);
        trigger.last_outcome = Some(outcome);
        trigger.updated_at = Utc::now();
        Ok(())
    }

    async fn reschedule_trigger(
        &self,
        id: TriggerId,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check("reschedule trigger")?;
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(&id)
            .ok_or(EngineError::TriggerNotFound(id))?;
        trigger.next_due_at = next_due;
        trigger.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.check("insert job")?;
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(EngineError::Internal(format!("job {} already exists", job.id)));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        self.check("update job")?;
        let mut inner = self.inner.lock().await;
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or(EngineError::JobNotFound(job.id))?;
        if stored.state.is_terminal() {
            return Err(ModelError::InvalidTransition {
                from: stored.state,
                to: job.state,
            }
            .into());
        }
        *stored = job.clone();
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.check("get job")?;
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn list_jobs_for_trigger(
        &self,
        trigger_id: TriggerId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Job>> {
        self.check("list jobs")?;
        let inner = self.inner.lock().await;
        let mut jobs: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|job| job.trigger_id == trigger_id)
            .collect();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        let skip = (page as usize).saturating_mul(page_size as usize);
        Ok(jobs
            .into_iter()
            .skip(skip)
            .take(page_size as usize)
            .cloned()
            .collect())
    }

    async fn list_pending_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        self.check("list pending jobs")?;
        let inner = self.inner.lock().await;
        let mut pending: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending && job.runnable_at() <= now)
            .cloned()
            .collect();
        pending.sort_by_key(|job| (job.runnable_at(), job.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        self.check("list running jobs")?;
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Running
                    && job.started_at.is_some_and(|started| started < cutoff)
            })
            .cloned()
            .collect())
    }
}
