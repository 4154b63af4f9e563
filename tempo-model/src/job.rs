use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ModelError, Result};
use crate::ids::{HolderId, JobId, LeaseId, TriggerId};
use crate::lock::ExecutionLock;

/// Lifecycle of one execution attempt.
///
/// `pending -> running -> {completed | failed | cancelled}`; a pending retry
/// may also be cancelled before it starts. Terminal states never change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(ModelError::UnknownState(other.to_string())),
        }
    }
}

/// What caused a job to exist.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOrigin {
    Schedule,
    Manual,
    Event,
}

impl JobOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOrigin::Schedule => "schedule",
            JobOrigin::Manual => "manual",
            JobOrigin::Event => "event",
        }
    }
}

impl FromStr for JobOrigin {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "schedule" => Ok(JobOrigin::Schedule),
            "manual" => Ok(JobOrigin::Manual),
            "event" => Ok(JobOrigin::Event),
            other => Err(ModelError::UnknownState(other.to_string())),
        }
    }
}

/// Failure classification recorded with each failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    HandlerNotFound,
    Timeout,
    Execution,
    /// Handler reported the failure as permanent, or panicked.
    Fatal,
    /// Heartbeat found the lock gone while the handler was running.
    LockLost,
    /// Worker vanished mid-execution; detected by reconciliation.
    Orphaned,
    Cancelled,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout
                | ErrorClass::Execution
                | ErrorClass::LockLost
                | ErrorClass::Orphaned
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::HandlerNotFound => "handler_not_found",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Execution => "execution",
            ErrorClass::Fatal => "fatal",
            ErrorClass::LockLost => "lock_lost",
            ErrorClass::Orphaned => "orphaned",
            ErrorClass::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Execution record for one firing attempt of a trigger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub trigger_id: TriggerId,
    pub state: JobState,
    pub origin: JobOrigin,
    /// Due time of the firing this attempt belongs to. Retries inherit it so
    /// the next due time is always computed from the original schedule.
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 1-based attempt number within the firing.
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub previous_job_id: Option<JobId>,
    pub holder_id: Option<HolderId>,
    /// Lock acquisition the attempt ran under. Separates incarnations of a
    /// worker that restarts with the same holder id.
    #[serde(default)]
    pub lease_id: Option<LeaseId>,
    /// Copied from the trigger so queued retries keep its ordering.
    #[serde(default)]
    pub priority: i32,
    pub max_duration_ms: u64,
    pub result: Option<Value>,
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(
        trigger_id: TriggerId,
        origin: JobOrigin,
        scheduled_for: DateTime<Utc>,
        max_attempts: u32,
        max_duration: Duration,
    ) -> Self {
        Self {
            id: JobId::new(),
            trigger_id,
            state: JobState::Pending,
            origin,
            scheduled_for,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            next_retry_at: None,
            previous_job_id: None,
            holder_id: None,
            lease_id: None,
            priority: 0,
            max_duration_ms: max_duration.as_millis() as u64,
            result: None,
            error: None,
        }
    }

    /// Fresh pending attempt following this failed one.
    pub fn next_attempt(&self, run_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            trigger_id: self.trigger_id,
            state: JobState::Pending,
            origin: self.origin,
            scheduled_for: self.scheduled_for,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempt: self.attempt.saturating_add(1),
            max_attempts: self.max_attempts,
            next_retry_at: Some(run_at),
            previous_job_id: Some(self.id),
            holder_id: None,
            lease_id: None,
            priority: self.priority,
            max_duration_ms: self.max_duration_ms,
            result: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time at which a pending job becomes runnable.
    pub fn runnable_at(&self) -> DateTime<Utc> {
        self.next_retry_at.unwrap_or(self.created_at)
    }

    fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn start(&mut self, holder: HolderId, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Running)?;
        self.started_at = Some(now);
        self.holder_id = Some(holder);
        Ok(())
    }

    /// Starts the attempt under `lock`, recording both holder and lease.
    pub fn start_under(&mut self, lock: &ExecutionLock, now: DateTime<Utc>) -> Result<()> {
        self.start(lock.holder_id.clone(), now)?;
        self.lease_id = Some(lock.lease_id);
        Ok(())
    }

    /// Whether `lock` is the acquisition this attempt is running under.
    /// Attempts started without a recorded lease match on holder alone.
    pub fn is_held_by(&self, lock: &ExecutionLock) -> bool {
        self.holder_id.as_ref() == Some(&lock.holder_id)
            && self.lease_id.is_none_or(|lease| lease == lock.lease_id)
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Completed)?;
        self.completed_at = Some(now);
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: JobError, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Failed)?;
        self.completed_at = Some(now);
        self.error = Some(error);
        Ok(())
    }

    pub fn cancel(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(JobState::Cancelled)?;
        self.completed_at = Some(now);
        self.error = Some(JobError::new(ErrorClass::Cancelled, reason));
        Ok(())
    }
}
