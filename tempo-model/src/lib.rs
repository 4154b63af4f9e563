//! Core data model definitions shared across tempo crates.
#![allow(missing_docs)]

pub mod error;
pub mod ids;
pub mod job;
pub mod lock;
pub mod retry;
pub mod trigger;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use ids::{HolderId, JobId, LeaseId, ResourceId, TriggerId};
pub use job::{ErrorClass, Job, JobError, JobOrigin, JobState};
pub use lock::ExecutionLock;
pub use retry::{BackoffKind, RetryPolicy};
pub use trigger::{
    ExecutionSpec, IntervalUnit, OutcomeSummary, ScheduleSpec, Trigger,
};
