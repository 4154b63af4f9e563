use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_core::config::EngineConfig;
use tempo_core::schedule;
use tempo_model::{ExecutionSpec, ScheduleSpec, Trigger, TriggerId};

/// Fully resolved worker configuration.
#[derive(Debug, Clone)]
pub struct TempoConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub backends: BackendConfig,
    pub engine: EngineConfig,
    /// Triggers created at startup when running against the memory store.
    pub triggers: Vec<SeedTrigger>,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address of the operational API.
    pub http_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
    pub store: StoreBackend,
    pub locks: LockBackend,
}

/// Where triggers and job history live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

/// Which lock manager arbitrates executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    Memory,
    Postgres,
    Redis,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres => "postgres",
        })
    }
}

impl fmt::Display for LockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockBackend::Memory => "memory",
            LockBackend::Postgres => "postgres",
            LockBackend::Redis => "redis",
        })
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

impl std::str::FromStr for LockBackend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(LockBackend::Memory),
            "postgres" | "postgresql" => Ok(LockBackend::Postgres),
            "redis" => Ok(LockBackend::Redis),
            other => Err(format!("unknown lock backend '{other}'")),
        }
    }
}

/// A trigger declared in `tempo.toml`:
///
/// ```toml
/// [[trigger]]
/// name = "heartbeat"
/// schedule = { kind = "interval", every = 30, unit = "seconds" }
/// execution = { task_type = "noop", max_duration_ms = 5000 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedTrigger {
    pub name: String,
    /// Fixed id so restarts address the same trigger; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TriggerId>,
    pub schedule: ScheduleSpec,
    pub execution: ExecutionSpec,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl SeedTrigger {
    /// Builds the trigger with its first due time computed from `now`.
    pub fn to_trigger(&self, now: DateTime<Utc>) -> anyhow::Result<Trigger> {
        schedule::validate(&self.schedule)
            .with_context(|| format!("seed trigger '{}' has an invalid schedule", self.name))?;
        let first_due = schedule::initial_due(&self.schedule, now)
            .with_context(|| format!("seed trigger '{}': cannot compute first due time", self.name))?;

        let mut trigger =
            Trigger::new(self.name.clone(), self.schedule.clone(), self.execution.clone())
                .with_priority(self.priority);
        if let Some(id) = self.id {
            trigger.id = id;
        }
        trigger.active = self.active;
        trigger.next_due_at = first_due;
        Ok(trigger)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_model::IntervalUnit;

    fn seed(schedule: ScheduleSpec) -> SeedTrigger {
        SeedTrigger {
            name: "nightly".into(),
            id: None,
            schedule,
            execution: ExecutionSpec {
                task_type: "noop".into(),
                payload: serde_json::Value::Null,
                max_duration_ms: 1_000,
                retry_policy: None,
            },
            priority: 3,
            active: true,
        }
    }

    #[test]
    fn interval_seed_is_due_one_interval_out() {
        let now = Utc::now();
        let trigger = seed(ScheduleSpec::Interval {
            every: 5,
            unit: IntervalUnit::Minutes,
        })
        .to_trigger(now)
        .unwrap();

        assert_eq!(trigger.owner_id, "nightly");
        assert_eq!(trigger.priority, 3);
        let due = trigger.next_due_at.expect("recurring trigger has a due time");
        assert!(due > now);
        assert!(due <= now + chrono::Duration::minutes(5));
    }

    #[test]
    fn invalid_cron_seed_is_rejected() {
        let err = seed(ScheduleSpec::Cron {
            expression: "not a cron".into(),
            timezone: "UTC".into(),
        })
        .to_trigger(Utc::now())
        .unwrap_err();
        assert!(err.to_string().contains("nightly"));
    }

    #[test]
    fn backend_names_parse_case_insensitively() {
        assert_eq!("Redis".parse::<LockBackend>(), Ok(LockBackend::Redis));
        assert_eq!("postgresql".parse::<StoreBackend>(), Ok(StoreBackend::Postgres));
        assert!("etcd".parse::<LockBackend>().is_err());
    }
}
