use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::ids::TriggerId;
use crate::job::JobState;

/// Unit for fixed-interval schedules.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    pub fn seconds(self) -> u64 {
        match self {
            IntervalUnit::Seconds => 1,
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 60 * 60,
            IntervalUnit::Days => 24 * 60 * 60,
        }
    }
}

/// When a trigger fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Cron expression evaluated in an IANA timezone (e.g. `Europe/Berlin`).
    Cron { expression: String, timezone: String },
    Interval { every: u64, unit: IntervalUnit },
    /// Fired only when signalled externally.
    Event,
    /// Fired only through manual execution.
    Manual,
}

impl ScheduleSpec {
    pub fn is_recurring(&self) -> bool {
        matches!(self, ScheduleSpec::Cron { .. } | ScheduleSpec::Interval { .. })
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            ScheduleSpec::Interval { every, unit } => {
                Some(Duration::from_secs(every.saturating_mul(unit.seconds())))
            }
            _ => None,
        }
    }
}

/// What a trigger runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Handler registry dispatch key.
    pub task_type: String,
    /// Opaque to the engine.
    #[serde(default)]
    pub payload: Value,
    pub max_duration_ms: u64,
    /// Name of a configured retry policy; `None` selects the default policy.
    #[serde(default)]
    pub retry_policy: Option<String>,
}

impl ExecutionSpec {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// Short summary of the most recent execution, kept on the trigger row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub state: JobState,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl fmt::Display for OutcomeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => {
                write!(f, "{} (attempt {}): {message}", self.state, self.attempt)
            }
            None => write!(f, "{} (attempt {})", self.state, self.attempt),
        }
    }
}

/// A persisted scheduling intent. Only `next_due_at`, `last_executed_at`
/// and `last_outcome` are written by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    /// Opaque scoping id, never interpreted by the engine.
    pub owner_id: String,
    pub schedule: ScheduleSpec,
    pub execution: ExecutionSpec,
    /// Higher runs first when due times tie.
    #[serde(default)]
    pub priority: i32,
    pub active: bool,
    pub next_due_at: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<OutcomeSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(
        owner_id: impl Into<String>,
        schedule: ScheduleSpec,
        execution: ExecutionSpec,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TriggerId::new(),
            owner_id: owner_id.into(),
            schedule,
            execution,
            priority: 0,
            active: true,
            next_due_at: None,
            last_executed_at: None,
            last_outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_next_due(mut self, next_due_at: DateTime<Utc>) -> Self {
        self.next_due_at = Some(next_due_at);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_due_at.is_some_and(|due| due <= now)
    }
}
