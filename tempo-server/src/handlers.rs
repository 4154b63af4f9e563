//! Diagnostic task types every worker ships with.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tempo_core::{ExecutionContext, HandlerError, HandlerRegistry, HandlerResult, TaskHandler};
use tracing::debug;

pub const NOOP: &str = "noop";
pub const SLEEP: &str = "sleep";

/// Succeeds immediately, echoing its payload.
#[derive(Debug, Default)]
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn execute(&self, payload: Value, ctx: ExecutionContext) -> HandlerResult {
        debug!(target: "tempo::engine", job = %ctx.job_id, attempt = ctx.attempt, "noop");
        Ok(payload)
    }
}

#[derive(Debug, Deserialize)]
struct SleepArgs {
    millis: u64,
}

/// Waits `{"millis": n}` or until cancelled.
#[derive(Debug, Default)]
pub struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, payload: Value, ctx: ExecutionContext) -> HandlerResult {
        let args: SleepArgs = serde_json::from_value(payload)
            .map_err(|err| HandlerError::fatal(format!("sleep expects {{\"millis\": n}}: {err}")))?;

        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                Err(HandlerError::retryable("sleep interrupted"))
            }
            _ = tokio::time::sleep(Duration::from_millis(args.millis)) => {
                Ok(json!({ "slept_ms": args.millis }))
            }
        }
    }
}

pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register(NOOP, Arc::new(NoopHandler));
    registry.register(SLEEP, Arc::new(SleepHandler));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempo_model::{JobId, TriggerId};
    use tokio_util::sync::CancellationToken;

    fn ctx(cancellation: CancellationToken) -> ExecutionContext {
        ExecutionContext {
            job_id: JobId::new(),
            trigger_id: TriggerId::new(),
            attempt: 1,
            deadline: Utc::now() + chrono::Duration::seconds(30),
            cancellation,
        }
    }

    #[tokio::test]
    async fn noop_echoes_payload() {
        let out = NoopHandler
            .execute(json!({ "a": 1 }), ctx(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(out, json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn sleep_rejects_bad_payload_permanently() {
        let err = SleepHandler
            .execute(json!({ "seconds": 1 }), ctx(CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(err.fatal);
    }

    #[tokio::test]
    async fn sleep_stops_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let err = SleepHandler
            .execute(json!({ "millis": 60_000 }), ctx(token))
            .await
            .unwrap_err();
        assert!(!err.fatal);
    }

    #[test]
    fn builtins_are_registered() {
        let registry = HandlerRegistry::new();
        register_builtin(&registry);
        assert!(registry.lookup(NOOP).is_some());
        assert!(registry.lookup(SLEEP).is_some());
    }
}
