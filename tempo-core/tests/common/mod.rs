#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tempo_core::config::EngineConfig;
use tempo_core::{
    EngineRuntime, HandlerError, HandlerRegistry, InProcEventBus, MemoryLockManager, MemoryStore,
    handler_fn,
};
use tempo_model::{ExecutionSpec, IntervalUnit, RetryPolicy, ScheduleSpec, Trigger};

/// Engine settings scaled down so tests finish in milliseconds.
pub fn fast_config(worker: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue.poll_interval_ms = 20;
    config.queue.dispatch_tick_ms = 5;
    config.lock.ttl_ms = 2_000;
    config.lock.renew_min_margin_ms = 200;
    config.executor.slots = 4;
    config.executor.worker_id = Some(worker.to_string());
    config.executor.shutdown_grace_ms = 500;
    config.reconcile.interval_ms = 50;
    config.reconcile.grace_ms = 50;
    config
        .retry
        .policies
        .insert("default".into(), RetryPolicy::fixed(3, Duration::from_millis(20)));
    config
        .retry
        .policies
        .insert("once".into(), RetryPolicy::fixed(1, Duration::from_millis(20)));
    config
}

pub fn interval_trigger(task_type: &str, every_secs: u64, due: DateTime<Utc>) -> Trigger {
    Trigger::new(
        "tests",
        ScheduleSpec::Interval {
            every: every_secs,
            unit: IntervalUnit::Seconds,
        },
        execution(task_type),
    )
    .with_next_due(due)
}

pub fn manual_trigger(task_type: &str) -> Trigger {
    Trigger::new("tests", ScheduleSpec::Manual, execution(task_type))
}

pub fn execution(task_type: &str) -> ExecutionSpec {
    ExecutionSpec {
        task_type: task_type.to_string(),
        payload: json!({ "source": "tests" }),
        max_duration_ms: 1_000,
        retry_policy: None,
    }
}

/// Shared backends plus an engine wired to them.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub locks: Arc<MemoryLockManager>,
    pub events: Arc<InProcEventBus>,
    pub handlers: HandlerRegistry,
    pub engine: EngineRuntime,
}

impl Harness {
    pub fn new(worker: &str) -> Self {
        Self::with_backends(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLockManager::new()),
            fast_config(worker),
        )
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_backends(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLockManager::new()),
            config,
        )
    }

    pub fn with_backends(
        store: Arc<MemoryStore>,
        locks: Arc<MemoryLockManager>,
        config: EngineConfig,
    ) -> Self {
        let events = Arc::new(InProcEventBus::new(256));
        let handlers = HandlerRegistry::new();
        let engine = EngineRuntime::builder(config)
            .with_store(Arc::clone(&store))
            .with_locks(locks.clone())
            .with_events(events.clone())
            .with_handlers(handlers.clone())
            .build()
            .expect("engine builds");
        Self {
            store,
            locks,
            events,
            handlers,
            engine,
        }
    }
}

/// Handler failing (retryably) for the first `failures` calls, then
/// succeeding. Returns the shared call counter.
pub fn register_flaky(handlers: &HandlerRegistry, task_type: &str, failures: u32) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    handlers.register(
        task_type,
        Arc::new(handler_fn(move |_payload, ctx| {
            let counter = Arc::clone(&counter);
            async move {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= failures {
                    Err(HandlerError::retryable(format!("attempt {} failed", ctx.attempt)))
                } else {
                    Ok(json!({ "calls": call }))
                }
            }
        })),
    );
    calls
}

/// Handler that runs until cancelled or `hold` elapses.
pub fn register_slow(handlers: &HandlerRegistry, task_type: &str, hold: Duration) {
    handlers.register(
        task_type,
        Arc::new(handler_fn(move |_payload, ctx| async move {
            tokio::select! {
                _ = ctx.cancellation.cancelled() => Err(HandlerError::retryable("stopped")),
                _ = tokio::time::sleep(hold) => Ok(json!("slept")),
            }
        })),
    );
}

/// Polls `check` until it yields `Some` or `timeout` passes.
pub async fn eventually<T, F, Fut>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
