use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ids::{HolderId, LeaseId, ResourceId};

/// Time-bounded exclusive right to execute work for one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLock {
    pub resource_id: ResourceId,
    pub holder_id: HolderId,
    pub lease_id: LeaseId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub renewals: u32,
}

impl ExecutionLock {
    pub fn new(
        resource_id: ResourceId,
        holder_id: HolderId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_id,
            holder_id,
            lease_id: LeaseId::new(),
            acquired_at: now,
            expires_at: expiry_from(now, ttl),
            renewals: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Same acquisition as `other` (holder and lease both match).
    pub fn same_lease(&self, other: &ExecutionLock) -> bool {
        self.holder_id == other.holder_id && self.lease_id == other.lease_id
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// `now + ttl`, saturating instead of panicking on overflow.
pub fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
