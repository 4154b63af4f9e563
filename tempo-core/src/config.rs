use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempo_model::RetryPolicy;

use crate::error::{EngineError, Result};

/// Global knobs that tune engine behaviour.
///
/// All fields carry defaults so deployments can supply partial configuration
/// files and only override what they care about.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Store polling and in-memory queue cadence.
    pub queue: QueueConfig,
    /// Lock TTL and heartbeat thresholds.
    pub lock: LockConfig,
    /// Execution slot pool and worker identity.
    pub executor: ExecutorConfig,
    /// Crash-recovery sweep cadence.
    pub reconcile: ReconcileConfig,
    /// Named retry policies referenced by triggers.
    pub retry: RetryConfig,
    /// In-process event bus sizing.
    pub events: EventConfig,
}

impl EngineConfig {
    /// Rejects settings that would stall or spin the engine.
    pub fn validate(&self) -> Result<()> {
        if self.executor.slots == 0 {
            return Err(EngineError::Config(
                "executor.slots must be at least 1".into(),
            ));
        }
        if self.queue.poll_interval_ms == 0 || self.queue.dispatch_tick_ms == 0 {
            return Err(EngineError::Config(
                "queue intervals must be greater than zero".into(),
            ));
        }
        if self.lock.ttl_ms == 0 {
            return Err(EngineError::Config("lock.ttl_ms must be > 0".into()));
        }
        if !(self.lock.renew_at_fraction > 0.0 && self.lock.renew_at_fraction < 1.0) {
            return Err(EngineError::Config(
                "lock.renew_at_fraction must be within (0, 1)".into(),
            ));
        }
        if self.lock.renew_min_margin_ms >= self.lock.ttl_ms {
            return Err(EngineError::Config(
                "lock.renew_min_margin_ms must be below lock.ttl_ms".into(),
            ));
        }
        if !self.retry.policies.contains_key(&self.retry.default_policy) {
            return Err(EngineError::Config(format!(
                "retry.default_policy {:?} is not defined",
                self.retry.default_policy
            )));
        }
        for (name, policy) in &self.retry.policies {
            if policy.max_attempts == 0 {
                return Err(EngineError::Config(format!(
                    "retry policy {name:?} must allow at least one attempt"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How often due triggers are pulled from the store.
    pub poll_interval_ms: u64,
    /// How often the dispatcher checks the in-memory heap head.
    pub dispatch_tick_ms: u64,
    /// Upper bound of triggers fetched per poll; extra ones wait a cycle.
    pub poll_batch_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            dispatch_tick_ms: 100,
            poll_batch_limit: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }
}

/// Lease/heartbeat tuning for execution locks.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL applied on acquire and on every heartbeat.
    pub ttl_ms: u64,
    /// Renew when remaining TTL drops below this fraction of the TTL (e.g. 0.5)
    pub renew_at_fraction: f32,
    /// Minimum margin before expiry to trigger a renewal regardless of fraction (ms)
    pub renew_min_margin_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            renew_at_fraction: 0.5,
            renew_min_margin_ms: 2_000,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn renew_margin(&self) -> Duration {
        Duration::from_millis(self.renew_min_margin_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum jobs running at once in this worker.
    pub slots: usize,
    /// Holder id used for locks; generated from host + pid when absent.
    pub worker_id: Option<String>,
    /// How long shutdown waits for running jobs before abandoning them.
    pub shutdown_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            slots: 16,
            worker_id: None,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl ExecutorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn resolve_worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| {
            format!("tempo-{}-{}", std::process::id(), uuid::Uuid::new_v4())
        })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_ms: u64,
    /// Extra time past `started + max_duration` before a running job is
    /// considered orphaned.
    pub grace_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            grace_ms: 30_000,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default_policy: String,
    pub policies: HashMap<String, RetryPolicy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert("default".to_string(), RetryPolicy::default());
        Self {
            default_policy: "default".to_string(),
            policies,
        }
    }
}

impl RetryConfig {
    /// Resolves a trigger's policy reference, falling back to the default
    /// policy for unknown or missing names.
    pub fn policy_for(&self, reference: Option<&str>) -> RetryPolicy {
        reference
            .and_then(|name| self.policies.get(name))
            .or_else(|| self.policies.get(&self.default_policy))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 1_024 }
    }
}
