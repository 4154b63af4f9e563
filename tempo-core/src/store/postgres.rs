use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::{PgPool, Row, postgres::PgRow};
use tempo_model::{
    HolderId, Job, JobError, JobId, JobOrigin, JobState, LeaseId, ModelError, OutcomeSummary,
    Trigger, TriggerId,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{JobStore, TriggerStore};
use crate::error::{EngineError, Result};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const TRIGGER_COLUMNS: &str = "id, owner_id, schedule, execution, priority, active, \
     next_due_at, last_executed_at, last_outcome, created_at, updated_at";

const JOB_COLUMNS: &str = "id, trigger_id, state, origin, scheduled_for, created_at, \
     started_at, completed_at, attempt, max_attempts, next_retry_at, previous_job_id, \
     holder_id, lease_id, priority, max_duration_ms, result, error";

/// Trigger and job persistence on Postgres.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresStore {
    /// Wraps `pool` after a connectivity check.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| EngineError::store("postgres health check", e))?;
        info!(target: "tempo::store", "connected to postgres");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Internal(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Stands in for the external CRUD layer in tests and seeding.
    pub async fn upsert_trigger(&self, trigger: &Trigger) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO triggers (id, owner_id, schedule, execution, priority, active,
                                  next_due_at, last_executed_at, last_outcome,
                                  created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET owner_id = EXCLUDED.owner_id,
                schedule = EXCLUDED.schedule,
                execution = EXCLUDED.execution,
                priority = EXCLUDED.priority,
                active = EXCLUDED.active,
                next_due_at = EXCLUDED.next_due_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(trigger.id.to_uuid())
        .bind(&trigger.owner_id)
        .bind(serde_json::to_value(&trigger.schedule)?)
        .bind(serde_json::to_value(&trigger.execution)?)
        .bind(trigger.priority)
        .bind(trigger.active)
        .bind(trigger.next_due_at)
        .bind(trigger.last_executed_at)
        .bind(
            trigger
                .last_outcome
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(trigger.created_at)
        .bind(trigger.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::store("upsert trigger", e))?;
        Ok(())
    }

    async fn trigger_exists(&self, id: TriggerId) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i32>("SELECT 1 FROM triggers WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::store("trigger lookup", e))?;
        Ok(found.is_some())
    }
}

fn decode<T>(operation: &str, res: std::result::Result<T, sqlx::Error>) -> Result<T> {
    res.map_err(|e| EngineError::store(operation, e))
}

fn trigger_from_row(row: &PgRow) -> Result<Trigger> {
    let op = "decode trigger";
    let schedule: Value = decode(op, row.try_get("schedule"))?;
    let execution: Value = decode(op, row.try_get("execution"))?;
    let outcome: Option<Value> = decode(op, row.try_get("last_outcome"))?;
    Ok(Trigger {
        id: TriggerId(decode(op, row.try_get::<Uuid, _>("id"))?),
        owner_id: decode(op, row.try_get("owner_id"))?,
        schedule: serde_json::from_value(schedule)?,
        execution: serde_json::from_value(execution)?,
        priority: decode(op, row.try_get("priority"))?,
        active: decode(op, row.try_get("active"))?,
        next_due_at: decode(op, row.try_get("next_due_at"))?,
        last_executed_at: decode(op, row.try_get("last_executed_at"))?,
        last_outcome: outcome
            .map(serde_json::from_value::<OutcomeSummary>)
            .transpose()?,
        created_at: decode(op, row.try_get("created_at"))?,
        updated_at: decode(op, row.try_get("updated_at"))?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let op = "decode job";
    let state: String = decode(op, row.try_get("state"))?;
    let origin: String = decode(op, row.try_get("origin"))?;
    let attempt: i32 = decode(op, row.try_get("attempt"))?;
    let max_attempts: i32 = decode(op, row.try_get("max_attempts"))?;
    let max_duration_ms: i64 = decode(op, row.try_get("max_duration_ms"))?;
    let error: Option<Value> = decode(op, row.try_get("error"))?;
    Ok(Job {
        id: JobId(decode(op, row.try_get::<Uuid, _>("id"))?),
        trigger_id: TriggerId(decode(op, row.try_get::<Uuid, _>("trigger_id"))?),
        state: state.parse::<JobState>()?,
        origin: origin.parse::<JobOrigin>()?,
        scheduled_for: decode(op, row.try_get("scheduled_for"))?,
        created_at: decode(op, row.try_get("created_at"))?,
        started_at: decode(op, row.try_get("started_at"))?,
        completed_at: decode(op, row.try_get("completed_at"))?,
        attempt: u32::try_from(attempt).unwrap_or(1),
        max_attempts: u32::try_from(max_attempts).unwrap_or(1),
        next_retry_at: decode(op, row.try_get("next_retry_at"))?,
        previous_job_id: decode(op, row.try_get::<Option<Uuid>, _>("previous_job_id"))?
            .map(JobId),
        holder_id: decode(op, row.try_get::<Option<String>, _>("holder_id"))?
            .map(HolderId::new),
        lease_id: decode(op, row.try_get::<Option<Uuid>, _>("lease_id"))?.map(LeaseId),
        priority: decode(op, row.try_get("priority"))?,
        max_duration_ms: u64::try_from(max_duration_ms).unwrap_or(0),
        result: decode(op, row.try_get("result"))?,
        error: error.map(serde_json::from_value::<JobError>).transpose()?,
    })
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl TriggerStore for PostgresStore {
    async fn list_active_triggers_due_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>> {
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers \
             WHERE active AND next_due_at IS NOT NULL AND next_due_at <= $1 \
             ORDER BY next_due_at, priority DESC, id \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(before)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::store("list due triggers", e))?;
        debug!(target: "tempo::store", count = rows.len(), "due triggers fetched");
        rows.iter().map(trigger_from_row).collect()
    }

    async fn get_trigger(&self, id: TriggerId) -> Result<Option<Trigger>> {
        let sql = format!("SELECT {TRIGGER_COLUMNS} FROM triggers WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::store("get trigger", e))?;
        row.as_ref().map(trigger_from_row).transpose()
    }

    async fn advance_next_due(
        &self,
        id: TriggerId,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE triggers
            SET next_due_at = $3, updated_at = NOW()
            WHERE id = $1 AND next_due_at = $2
            "#,
        )
        .bind(id.to_uuid())
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::store("advance next due", e))?;
        if res.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.trigger_exists(id).await? {
            return Err(EngineError::TriggerNotFound(id));
        }
        Ok(false)
    }

    async fn update_trigger_schedule_state(
        &self,
        id: TriggerId,
        next_due: Option<DateTime<Utc>>,
        last_executed_at: DateTime<Utc>,
        outcome: OutcomeSummary,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE triggers
            SET next_due_at = COALESCE($2, next_due_at),
                last_executed_at = $3,
                last_outcome = $4,
                updated_at = NOW()
            WHERE id = $1
              AND ($2::timestamptz IS NULL OR next_due_at IS NULL OR next_due_at <= $2)
            "#,
        )
        .bind(id.to_uuid())
        .bind(next_due)
        .bind(last_executed_at)
        .bind(serde_json::to_value(&outcome)?)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::store("update trigger schedule state", e))?;
        if res.rows_affected() > 0 {
            return Ok(());
        }
        if !self.trigger_exists(id).await? {
            return Err(EngineError::TriggerNotFound(id));
        }
        Err(EngineError::InvalidSchedule(format!(
            "next due time of trigger {id} may not move backwards"
        )))
    }

    async fn reschedule_trigger(
        &self,
        id: TriggerId,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let res = sqlx::query(
            "UPDATE triggers SET next_due_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.to_uuid())
        .bind(next_due)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::store("reschedule trigger", e))?;
        if res.rows_affected() == 0 {
            return Err(EngineError::TriggerNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        );
        sqlx::query(&sql)
            .bind(job.id.to_uuid())
            .bind(job.trigger_id.to_uuid())
            .bind(job.state.as_str())
            .bind(job.origin.as_str())
            .bind(job.scheduled_for)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(to_i32(job.attempt))
            .bind(to_i32(job.max_attempts))
            .bind(job.next_retry_at)
            .bind(job.previous_job_id.map(|id| id.to_uuid()))
            .bind(job.holder_id.as_ref().map(|h| h.as_str().to_string()))
            .bind(job.lease_id.map(|lease| lease.0))
            .bind(job.priority)
            .bind(i64::try_from(job.max_duration_ms).unwrap_or(i64::MAX))
            .bind(&job.result)
            .bind(job.error.as_ref().map(serde_json::to_value).transpose()?)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::store("insert job", e))?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2,
                started_at = $3,
                completed_at = $4,
                next_retry_at = $5,
                holder_id = $6,
                result = $7,
                error = $8,
                lease_id = $9
            WHERE id = $1
              AND state NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(job.id.to_uuid())
        .bind(job.state.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.next_retry_at)
        .bind(job.holder_id.as_ref().map(|h| h.as_str().to_string()))
        .bind(&job.result)
        .bind(job.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(job.lease_id.map(|lease| lease.0))
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::store("update job", e))?;
        if res.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_job(job.id).await? {
            None => Err(EngineError::JobNotFound(job.id)),
            Some(stored) => Err(ModelError::InvalidTransition {
                from: stored.state,
                to: job.state,
            }
            .into()),
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::store("get job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs_for_trigger(
        &self,
        trigger_id: TriggerId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE trigger_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let offset = i64::from(page).saturating_mul(i64::from(page_size));
        let rows = sqlx::query(&sql)
            .bind(trigger_id.to_uuid())
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::store("list jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_pending_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state = 'pending' AND COALESCE(next_retry_at, created_at) <= $1 \
             ORDER BY COALESCE(next_retry_at, created_at), id \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::store("list pending jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state = 'running' AND started_at < $1 \
             ORDER BY started_at"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::store("list running jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }
}
