//! # Tempo Server
//!
//! Worker process for the tempo orchestration engine. Each instance polls
//! the shared trigger store, competes for execution locks, runs handlers,
//! and exposes a small operational API. Instances are interchangeable; start
//! as many as the workload needs.

pub mod api;
pub mod bootstrap;
pub mod errors;
pub mod handlers;
