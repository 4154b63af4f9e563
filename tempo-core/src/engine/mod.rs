//! The execution engine: background loops, job execution and the
//! operational API.

mod executor;
mod health;
mod heartbeat;
mod reconciler;
mod runtime;

pub use executor::RunReport;
pub use health::{EngineHealth, EngineMetrics, MetricsSnapshot};
pub use reconciler::SweepReport;
pub use runtime::{EngineRuntime, EngineRuntimeBuilder, MAX_PAGE_SIZE};
