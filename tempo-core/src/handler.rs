//! Task-type handlers and the registry the engine dispatches through.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tempo_model::{JobId, TriggerId};
use tokio_util::sync::CancellationToken;

/// Failure reported by a handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    /// Permanent failures are never retried.
    pub fatal: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Per-invocation context handed to handlers.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub trigger_id: TriggerId,
    pub attempt: u32,
    /// Hard deadline; the engine abandons the call once it passes.
    pub deadline: DateTime<Utc>,
    /// Fires on explicit cancellation, timeout, or lock loss. Long-running
    /// handlers should select on it to stop promptly.
    pub cancellation: CancellationToken,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, payload: Value, ctx: ExecutionContext) -> HandlerResult;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn execute(&self, payload: Value, ctx: ExecutionContext) -> HandlerResult {
        (self.0)(payload, ctx).await
    }
}

/// Maps task-type names to handlers. Registration is additive and may
/// happen while the engine runs.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn TaskHandler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> =
            self.handlers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("task_types", &names)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `task_type`, returning the handler it replaced.
    pub fn register(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Option<Arc<dyn TaskHandler>> {
        let task_type = task_type.into();
        tracing::debug!(target: "tempo::handlers", task_type = %task_type, "handler registered");
        self.handlers.insert(task_type, handler)
    }

    pub fn lookup(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(task_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn task_types(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            job_id: JobId::new(),
            trigger_id: TriggerId::new(),
            attempt: 1,
            deadline: Utc::now(),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn registered_handler_is_found_by_task_type() {
        let registry = HandlerRegistry::new();
        registry.register(
            "echo",
            Arc::new(handler_fn(|payload, _ctx| async move { Ok(payload) })),
        );

        assert!(registry.lookup("missing").is_none());
        let handler = registry.lookup("echo").expect("echo registered");
        let out = handler.execute(json!({"n": 1}), ctx()).await.expect("ok");
        assert_eq!(out, json!({"n": 1}));
    }

    #[tokio::test]
    async fn re_registering_replaces_handler() {
        let registry = HandlerRegistry::new();
        let first = registry.register(
            "job",
            Arc::new(handler_fn(|_, _| async { Ok(json!(1)) })),
        );
        assert!(first.is_none());
        let replaced = registry.register(
            "job",
            Arc::new(handler_fn(|_, _| async { Err(HandlerError::fatal("no")) })),
        );
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);

        let err = registry
            .lookup("job")
            .expect("registered")
            .execute(Value::Null, ctx())
            .await
            .unwrap_err();
        assert!(err.fatal);
    }
}
