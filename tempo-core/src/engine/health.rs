use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters accumulated by a running engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    lock_attempts: AtomicU64,
    lock_denied: AtomicU64,
    dispatched: AtomicU64,
    dispatch_latency_ms_total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries_scheduled: AtomicU64,
    orphans_recovered: AtomicU64,
}

impl EngineMetrics {
    pub fn record_lock_attempt(&self, acquired: bool) {
        self.lock_attempts.fetch_add(1, Ordering::Relaxed);
        if !acquired {
            self.lock_denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records how late a job started relative to when it became due.
    pub fn record_dispatch(&self, due_at: DateTime<Utc>, started_at: DateTime<Utc>) {
        let latency = (started_at - due_at).num_milliseconds().max(0) as u64;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.dispatch_latency_ms_total
            .fetch_add(latency, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orphan(&self) {
        self.orphans_recovered.fetch_add(1, Ordering::Relaxed);
    }

    /// Denied acquisitions over all attempts; 0 before the first attempt.
    pub fn lock_contention_rate(&self) -> f64 {
        let attempts = self.lock_attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        self.lock_denied.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    pub fn avg_dispatch_latency_ms(&self) -> f64 {
        let dispatched = self.dispatched.load(Ordering::Relaxed);
        if dispatched == 0 {
            return 0.0;
        }
        self.dispatch_latency_ms_total.load(Ordering::Relaxed) as f64 / dispatched as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lock_attempts: self.lock_attempts.load(Ordering::Relaxed),
            lock_denied: self.lock_denied.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            orphans_recovered: self.orphans_recovered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the raw counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub lock_attempts: u64,
    pub lock_denied: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries_scheduled: u64,
    pub orphans_recovered: u64,
}

/// Answer to a health query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub worker_id: String,
    pub lock_backend: String,
    /// Execution slots currently occupied.
    pub active_workers: usize,
    pub slot_capacity: usize,
    /// Entries waiting in the in-memory heap.
    pub queue_depth: usize,
    /// Entries dequeued and not yet finished.
    pub in_flight: usize,
    /// Handlers executing in this worker right now.
    pub running_jobs: usize,
    pub lock_contention_rate: f64,
    pub avg_dispatch_latency_ms: f64,
    pub handlers: usize,
    pub accepting_work: bool,
    pub counters: MetricsSnapshot,
}
