use std::time::Duration;

use tempo_model::{JobId, ModelError, TriggerId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Another holder owns the resource; try again next cycle.
    #[error("lock denied for resource {0}")]
    LockDenied(String),

    #[error("no handler registered for task type {0:?}")]
    HandlerNotFound(String),

    #[error("handler exceeded deadline of {0:?}")]
    HandlerTimeout(Duration),

    #[error("handler failed: {message}")]
    HandlerExecution { message: String, fatal: bool },

    #[error("store unavailable during {operation}: {message}")]
    StoreUnavailable { operation: String, message: String },

    #[error("retries exhausted for trigger {trigger_id} after {attempts} attempts")]
    RetryExhausted { trigger_id: TriggerId, attempts: u32 },

    #[error("trigger not found: {0}")]
    TriggerNotFound(TriggerId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid job transition: {0}")]
    InvalidTransition(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The runtime no longer accepts work.
    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn store(
        operation: impl Into<String>,
        err: impl std::fmt::Display,
    ) -> Self {
        EngineError::StoreUnavailable {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Transient errors skip the current cycle instead of failing anything.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::StoreUnavailable { .. } | EngineError::LockDenied(_)
        )
    }
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidSchedule(msg) => EngineError::InvalidSchedule(msg),
            other => EngineError::InvalidTransition(other.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::store("postgres", err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::store("redis", err)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
