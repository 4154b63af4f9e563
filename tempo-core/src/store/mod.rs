//! Persistence ports for triggers and job records.
//!
//! The trigger write path belongs to an external CRUD layer; the engine only
//! reads definitions and writes `next_due_at`, `last_executed_at` and
//! `last_outcome`. Job records are append-only per id and immutable once
//! terminal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempo_model::{Job, JobId, OutcomeSummary, Trigger, TriggerId};

use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Active triggers with `next_due_at <= before`, earliest first.
    async fn list_active_triggers_due_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>>;

    async fn get_trigger(&self, id: TriggerId) -> Result<Option<Trigger>>;

    /// Atomically moves `next_due_at` from `expected` to `next`. Returns
    /// `false` when the stored value no longer equals `expected`, meaning
    /// another worker already claimed this firing.
    async fn advance_next_due(
        &self,
        id: TriggerId,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Records the outcome of a firing. `next_due` of `None` leaves the
    /// stored due time untouched; a value lower than the stored one is
    /// rejected.
    async fn update_trigger_schedule_state(
        &self,
        id: TriggerId,
        next_due: Option<DateTime<Utc>>,
        last_executed_at: DateTime<Utc>,
        outcome: OutcomeSummary,
    ) -> Result<()>;

    /// Explicit reschedule; the only way to move a due time backwards.
    async fn reschedule_trigger(
        &self,
        id: TriggerId,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// Persists a state change. Fails with `InvalidTransition` when the
    /// stored record is already terminal.
    async fn update_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Page of a trigger's jobs, newest first. `page` is zero-based.
    async fn list_jobs_for_trigger(
        &self,
        trigger_id: TriggerId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Job>>;

    /// Pending attempts runnable at or before `now`.
    async fn list_pending_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Running jobs whose `started_at` precedes `cutoff`.
    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>>;
}
