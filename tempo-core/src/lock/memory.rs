use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tempo_model::lock::expiry_from;
use tempo_model::{ExecutionLock, HolderId, ResourceId};
use tracing::{debug, trace};

use super::{Acquire, LockManager, Renewal};
use crate::error::Result;

/// Single-process lock table. Suitable for one worker or for tests; every
/// check-and-set happens under the shard lock of the resource's entry.
#[derive(Clone, Default)]
pub struct MemoryLockManager {
    locks: Arc<DashMap<ResourceId, ExecutionLock>>,
}

impl fmt::Debug for MemoryLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLockManager")
            .field("entries", &self.locks.len())
            .finish()
    }
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(
        &self,
        resource: &ResourceId,
        holder: &HolderId,
        ttl: Duration,
    ) -> Result<Acquire> {
        let now = Utc::now();
        match self.locks.entry(resource.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    trace!(
                        target: "tempo::lock",
                        resource = %resource,
                        held_by = %occupied.get().holder_id,
                        "lock busy"
                    );
                    return Ok(Acquire::Denied);
                }
                debug!(
                    target: "tempo::lock",
                    resource = %resource,
                    previous = %occupied.get().holder_id,
                    "taking over expired lock"
                );
                let lock =
                    ExecutionLock::new(resource.clone(), holder.clone(), ttl, now);
                occupied.insert(lock.clone());
                Ok(Acquire::Acquired(lock))
            }
            Entry::Vacant(vacant) => {
                let lock =
                    ExecutionLock::new(resource.clone(), holder.clone(), ttl, now);
                vacant.insert(lock.clone());
                Ok(Acquire::Acquired(lock))
            }
        }
    }

    async fn heartbeat(&self, lock: &ExecutionLock, ttl: Duration) -> Result<Renewal> {
        let now = Utc::now();
        let Some(mut current) = self.locks.get_mut(&lock.resource_id) else {
            return Ok(Renewal::Lost);
        };
        if !current.same_lease(lock) || current.is_expired(now) {
            return Ok(Renewal::Lost);
        }
        current.expires_at = expiry_from(now, ttl);
        current.renewals = current.renewals.saturating_add(1);
        Ok(Renewal::Extended(current.value().clone()))
    }

    async fn release(&self, lock: &ExecutionLock) -> Result<bool> {
        let removed = self
            .locks
            .remove_if(&lock.resource_id, |_, current| current.same_lease(lock))
            .is_some();
        Ok(removed)
    }

    async fn inspect(&self, resource: &ResourceId) -> Result<Option<ExecutionLock>> {
        let now = Utc::now();
        Ok(self
            .locks
            .get(resource)
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| lock.value().clone()))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let before = self.locks.len();
        self.locks.retain(|_, lock| !lock.is_expired(now));
        Ok(before.saturating_sub(self.locks.len()) as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(name: &str) -> ResourceId {
        ResourceId(name.to_string())
    }

    #[tokio::test]
    async fn second_holder_is_denied_until_release() {
        let locks = MemoryLockManager::new();
        let ttl = Duration::from_secs(30);
        let a = locks
            .acquire(&res("r"), &HolderId::new("a"), ttl)
            .await
            .unwrap()
            .into_lock()
            .expect("a acquires");

        let denied = locks.acquire(&res("r"), &HolderId::new("b"), ttl).await.unwrap();
        assert_eq!(denied, Acquire::Denied);

        assert!(locks.release(&a).await.unwrap());
        // Releasing twice is a no-op.
        assert!(!locks.release(&a).await.unwrap());

        let b = locks.acquire(&res("r"), &HolderId::new("b"), ttl).await.unwrap();
        assert!(matches!(b, Acquire::Acquired(_)));
    }

    #[tokio::test]
    async fn stale_lease_cannot_renew_or_release_successor() {
        let locks = MemoryLockManager::new();
        let short = Duration::from_millis(20);
        let stale = locks
            .acquire(&res("r"), &HolderId::new("a"), short)
            .await
            .unwrap()
            .into_lock()
            .expect("acquire");

        tokio::time::sleep(Duration::from_millis(40)).await;

        let successor = locks
            .acquire(&res("r"), &HolderId::new("b"), Duration::from_secs(30))
            .await
            .unwrap()
            .into_lock()
            .expect("expired lock is free");

        assert_eq!(
            locks.heartbeat(&stale, Duration::from_secs(30)).await.unwrap(),
            Renewal::Lost
        );
        assert!(!locks.release(&stale).await.unwrap());
        let held = locks.inspect(&res("r")).await.unwrap().expect("still held");
        assert!(held.same_lease(&successor));
    }

    #[tokio::test]
    async fn heartbeat_extends_expiry() {
        let locks = MemoryLockManager::new();
        let lock = locks
            .acquire(&res("r"), &HolderId::new("a"), Duration::from_secs(1))
            .await
            .unwrap()
            .into_lock()
            .expect("acquire");

        let Renewal::Extended(renewed) =
            locks.heartbeat(&lock, Duration::from_secs(60)).await.unwrap()
        else {
            panic!("heartbeat should extend a live lock");
        };
        assert!(renewed.expires_at > lock.expires_at);
        assert_eq!(renewed.renewals, 1);
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let locks = MemoryLockManager::new();
        locks
            .acquire(&res("old"), &HolderId::new("a"), Duration::from_millis(1))
            .await
            .unwrap();
        locks
            .acquire(&res("live"), &HolderId::new("a"), Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(locks.purge_expired().await.unwrap(), 1);
        assert!(locks.inspect(&res("live")).await.unwrap().is_some());
    }
}
