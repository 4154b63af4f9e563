//! # Tempo Core
//!
//! Task orchestration engine: decides *when* persisted triggers are due,
//! guarantees that at most one worker executes a trigger at a time, runs
//! the registered handler under a deadline, and retries failures with
//! configurable backoff.
//!
//! ## Overview
//!
//! - **Scheduling queue**: an in-memory min-heap fed by polling the
//!   trigger store; the store stays the source of truth ([`queue`])
//! - **Execution locks**: TTL-bounded, lease-fenced locks with in-memory,
//!   Redis and PostgreSQL backends ([`lock`])
//! - **Execution engine**: slot-bounded job execution with heartbeats,
//!   deadlines, retries and crash recovery ([`engine`])
//! - **Retry policies**: fixed, linear, exponential with jitter and
//!   fibonacci backoff ([`retry`])
//!
//! ## Feature Flags
//!
//! - `postgres`: PostgreSQL trigger/job store and lock backend (SQLx)
//! - `redis`: Redis lock backend
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tempo_core::{
//!     EngineConfig, EngineRuntime, HandlerRegistry, MemoryLockManager, MemoryStore, handler_fn,
//! };
//!
//! # async fn run() -> tempo_core::Result<()> {
//! let handlers = HandlerRegistry::new();
//! handlers.register(
//!     "noop",
//!     Arc::new(handler_fn(|_payload, _ctx| async { Ok(serde_json::Value::Null) })),
//! );
//!
//! let engine = EngineRuntime::builder(EngineConfig::default())
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .with_locks(Arc::new(MemoryLockManager::new()))
//!     .with_handlers(handlers)
//!     .build()?;
//! engine.start().await?;
//! // ...
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod handler;
pub mod lock;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod slots;
pub mod store;

pub use config::EngineConfig;
pub use engine::{EngineHealth, EngineRuntime, EngineRuntimeBuilder, SweepReport};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventPublisher, InProcEventBus};
pub use handler::{
    ExecutionContext, HandlerError, HandlerRegistry, HandlerResult, TaskHandler, handler_fn,
};
pub use lock::{Acquire, LockManager, MemoryLockManager, Renewal};
pub use store::{JobStore, MemoryStore, TriggerStore};

#[cfg(feature = "postgres")]
pub use lock::PostgresLockManager;
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
#[cfg(feature = "redis")]
pub use lock::RedisLockManager;
