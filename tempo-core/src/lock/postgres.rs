use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tempo_model::{ExecutionLock, HolderId, LeaseId, ResourceId};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Acquire, LockManager, Renewal};
use crate::error::{EngineError, Result};

/// Lock manager backed by the `execution_locks` table. Expiry is evaluated
/// against the database clock so workers with skewed clocks agree.
#[derive(Clone)]
pub struct PostgresLockManager {
    pool: PgPool,
}

impl fmt::Debug for PostgresLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresLockManager")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn lock_from_row(row: &PgRow) -> std::result::Result<ExecutionLock, sqlx::Error> {
    let renewals: i32 = row.try_get("renewals")?;
    Ok(ExecutionLock {
        resource_id: ResourceId(row.try_get("resource_id")?),
        holder_id: HolderId::new(row.try_get::<String, _>("holder_id")?),
        lease_id: LeaseId(row.try_get::<Uuid, _>("lease_id")?),
        acquired_at: row.try_get::<DateTime<Utc>, _>("acquired_at")?,
        expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
        renewals: u32::try_from(renewals).unwrap_or(0),
    })
}

#[async_trait]
impl LockManager for PostgresLockManager {
    async fn acquire(
        &self,
        resource: &ResourceId,
        holder: &HolderId,
        ttl: Duration,
    ) -> Result<Acquire> {
        // The conditional upsert either inserts, takes over an expired row,
        // or returns nothing; all in one statement.
        let row = sqlx::query(
            r#"
            INSERT INTO execution_locks
                (resource_id, holder_id, lease_id, acquired_at, expires_at, renewals)
            VALUES
                ($1, $2, $3, NOW(), NOW() + ($4::bigint) * INTERVAL '1 millisecond', 0)
            ON CONFLICT (resource_id) DO UPDATE
            SET holder_id = EXCLUDED.holder_id,
                lease_id = EXCLUDED.lease_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at,
                renewals = 0
            WHERE execution_locks.expires_at <= NOW()
            RETURNING resource_id, holder_id, lease_id, acquired_at, expires_at, renewals
            "#,
        )
        .bind(resource.as_str())
        .bind(holder.as_str())
        .bind(LeaseId::new().0)
        .bind(ttl_ms(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::store("lock acquire", e))?;

        match row {
            Some(row) => {
                let lock = lock_from_row(&row)
                    .map_err(|e| EngineError::store("lock acquire decode", e))?;
                Ok(Acquire::Acquired(lock))
            }
            None => {
                debug!(target: "tempo::lock", resource = %resource, "lock busy");
                Ok(Acquire::Denied)
            }
        }
    }

    async fn heartbeat(&self, lock: &ExecutionLock, ttl: Duration) -> Result<Renewal> {
        let row = sqlx::query(
            r#"
            UPDATE execution_locks
            SET expires_at = NOW() + ($4::bigint) * INTERVAL '1 millisecond',
                renewals = renewals + 1
            WHERE resource_id = $1
              AND holder_id = $2
              AND lease_id = $3
              AND expires_at > NOW()
            RETURNING resource_id, holder_id, lease_id, acquired_at, expires_at, renewals
            "#,
        )
        .bind(lock.resource_id.as_str())
        .bind(lock.holder_id.as_str())
        .bind(lock.lease_id.0)
        .bind(ttl_ms(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::store("lock heartbeat", e))?;

        match row {
            Some(row) => Ok(Renewal::Extended(
                lock_from_row(&row)
                    .map_err(|e| EngineError::store("lock heartbeat decode", e))?,
            )),
            None => {
                warn!(
                    target: "tempo::lock",
                    resource = %lock.resource_id,
                    holder = %lock.holder_id,
                    "heartbeat found lock taken or expired"
                );
                Ok(Renewal::Lost)
            }
        }
    }

    async fn release(&self, lock: &ExecutionLock) -> Result<bool> {
        let res = sqlx::query(
            r#"
            DELETE FROM execution_locks
            WHERE resource_id = $1 AND holder_id = $2 AND lease_id = $3
            "#,
        )
        .bind(lock.resource_id.as_str())
        .bind(lock.holder_id.as_str())
        .bind(lock.lease_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::store("lock release", e))?;
        Ok(res.rows_affected() > 0)
    }

    async fn inspect(&self, resource: &ResourceId) -> Result<Option<ExecutionLock>> {
        let row = sqlx::query(
            r#"
            SELECT resource_id, holder_id, lease_id, acquired_at, expires_at, renewals
            FROM execution_locks
            WHERE resource_id = $1 AND expires_at > NOW()
            "#,
        )
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::store("lock inspect", e))?;

        row.as_ref()
            .map(lock_from_row)
            .transpose()
            .map_err(|e| EngineError::store("lock inspect decode", e))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM execution_locks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::store("purge expired locks", e))?;
        Ok(res.rows_affected())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrator = "crate::store::postgres::MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn postgres_lock_is_exclusive_and_fenced(pool: PgPool) {
        let locks = PostgresLockManager::new(pool);
        let resource = ResourceId("trigger:pg".into());
        let ttl = Duration::from_secs(30);

        let a = locks
            .acquire(&resource, &HolderId::new("a"), ttl)
            .await
            .unwrap()
            .into_lock()
            .expect("a acquires");
        assert_eq!(
            locks.acquire(&resource, &HolderId::new("b"), ttl).await.unwrap(),
            Acquire::Denied
        );

        let mut forged = a.clone();
        forged.lease_id = LeaseId::new();
        assert_eq!(locks.heartbeat(&forged, ttl).await.unwrap(), Renewal::Lost);
        assert!(!locks.release(&forged).await.unwrap());

        assert!(matches!(
            locks.heartbeat(&a, ttl).await.unwrap(),
            Renewal::Extended(_)
        ));
        assert!(locks.release(&a).await.unwrap());
        assert!(locks.inspect(&resource).await.unwrap().is_none());
    }

    #[sqlx::test(migrator = "crate::store::postgres::MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn expired_lock_is_taken_over(pool: PgPool) {
        let locks = PostgresLockManager::new(pool);
        let resource = ResourceId("trigger:pg-expiry".into());

        locks
            .acquire(&resource, &HolderId::new("a"), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let b = locks
            .acquire(&resource, &HolderId::new("b"), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(matches!(b, Acquire::Acquired(ref lock) if lock.holder_id.as_str() == "b"));
        assert_eq!(locks.purge_expired().await.unwrap(), 0);
    }
}
