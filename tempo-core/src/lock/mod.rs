//! TTL-bounded execution locks.
//!
//! A lock is held by one holder until it is released or its TTL lapses
//! without a heartbeat. Every acquisition carries a fresh [`LeaseId`] and
//! both heartbeat and release check holder *and* lease, so a worker that
//! lost its lock can never extend or delete the lock of its successor.
//!
//! [`LeaseId`]: tempo_model::LeaseId

use std::time::Duration;

use async_trait::async_trait;
use tempo_model::{ExecutionLock, HolderId, ResourceId};

use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryLockManager;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLockManager;
#[cfg(feature = "redis")]
pub use redis::RedisLockManager;

/// Outcome of an acquire attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acquire {
    Acquired(ExecutionLock),
    /// Held by someone else and not yet expired.
    Denied,
}

impl Acquire {
    pub fn into_lock(self) -> Option<ExecutionLock> {
        match self {
            Acquire::Acquired(lock) => Some(lock),
            Acquire::Denied => None,
        }
    }
}

/// Outcome of a heartbeat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Renewal {
    /// TTL extended; the returned lock carries the new expiry.
    Extended(ExecutionLock),
    /// The lock expired or now belongs to another lease.
    Lost,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Takes the lock if it is free or its previous holder's TTL lapsed.
    async fn acquire(
        &self,
        resource: &ResourceId,
        holder: &HolderId,
        ttl: Duration,
    ) -> Result<Acquire>;

    /// Extends the TTL of a lock this holder still owns.
    async fn heartbeat(&self, lock: &ExecutionLock, ttl: Duration) -> Result<Renewal>;

    /// Releases the lock if it is still this lease's. Idempotent; returns
    /// whether anything was removed.
    async fn release(&self, lock: &ExecutionLock) -> Result<bool>;

    /// Current non-expired lock for `resource`, if any.
    async fn inspect(&self, resource: &ResourceId) -> Result<Option<ExecutionLock>>;

    /// Drops entries whose TTL lapsed. Expired locks are already treated
    /// as free, so this only bounds storage. Backends with native expiry
    /// keep the default.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }

    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;
}
