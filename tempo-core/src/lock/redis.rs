use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{Script, aio::ConnectionManager};
use tempo_model::lock::expiry_from;
use tempo_model::{ExecutionLock, HolderId, LeaseId, ResourceId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Acquire, LockManager, Renewal};
use crate::error::{EngineError, Result};

const KEY_PREFIX: &str = "tempo:lock:";

/// Extends the TTL only while the stored token is ours.
static HEARTBEAT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return 0
        "#,
    )
});

/// Deletes the key only while the stored token is ours.
static RELEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
});

/// Returns the token and its remaining TTL in one round trip.
static INSPECT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local token = redis.call('GET', KEYS[1])
        return {token, redis.call('PTTL', KEYS[1])}
        "#,
    )
});

/// Lock manager backed by Redis keys with a PX expiry. Redis drops expired
/// keys itself, so a crashed holder's lock frees up without any sweep.
#[derive(Clone)]
pub struct RedisLockManager {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLockManager")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisLockManager {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!(target: "tempo::lock", "connecting to redis lock backend");
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Config(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::store("redis connect", e))?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(resource: &ResourceId) -> String {
        format!("{KEY_PREFIX}{resource}")
    }
}

/// Stored value identifying one acquisition: `lease|acquired_ms|holder`.
/// The holder goes last because it may itself contain separators.
fn token(lock: &ExecutionLock) -> String {
    format!(
        "{}|{}|{}",
        lock.lease_id,
        lock.acquired_at.timestamp_millis(),
        lock.holder_id
    )
}

fn parse_token(
    resource: &ResourceId,
    token: &str,
    pttl_ms: i64,
    now: DateTime<Utc>,
) -> Option<ExecutionLock> {
    let mut parts = token.splitn(3, '|');
    let lease = Uuid::parse_str(parts.next()?).ok()?;
    let acquired_ms: i64 = parts.next()?.parse().ok()?;
    let holder = parts.next()?;
    let acquired_at = Utc.timestamp_millis_opt(acquired_ms).single()?;
    let remaining = Duration::from_millis(u64::try_from(pttl_ms).ok()?);
    Some(ExecutionLock {
        resource_id: resource.clone(),
        holder_id: HolderId::new(holder),
        lease_id: LeaseId(lease),
        acquired_at,
        expires_at: expiry_from(now, remaining),
        renewals: 0,
    })
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(
        &self,
        resource: &ResourceId,
        holder: &HolderId,
        ttl: Duration,
    ) -> Result<Acquire> {
        let now = Utc::now();
        let mut lock = ExecutionLock::new(resource.clone(), holder.clone(), ttl, now);
        // Token round-trips at millisecond precision.
        lock.acquired_at = Utc
            .timestamp_millis_opt(now.timestamp_millis())
            .single()
            .unwrap_or(now);

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(resource))
            .arg(token(&lock))
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| EngineError::store("redis lock acquire", e))?;

        match reply {
            Some(_) => Ok(Acquire::Acquired(lock)),
            None => {
                debug!(target: "tempo::lock", resource = %resource, "lock busy");
                Ok(Acquire::Denied)
            }
        }
    }

    async fn heartbeat(&self, lock: &ExecutionLock, ttl: Duration) -> Result<Renewal> {
        let mut conn = self.conn.clone();
        let extended: i64 = HEARTBEAT
            .key(Self::key(&lock.resource_id))
            .arg(token(lock))
            .arg(ttl_ms(ttl))
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| EngineError::store("redis lock heartbeat", e))?;

        if extended == 1 {
            let mut renewed = lock.clone();
            renewed.expires_at = expiry_from(Utc::now(), ttl);
            renewed.renewals = renewed.renewals.saturating_add(1);
            Ok(Renewal::Extended(renewed))
        } else {
            warn!(
                target: "tempo::lock",
                resource = %lock.resource_id,
                holder = %lock.holder_id,
                "heartbeat found lock taken or expired"
            );
            Ok(Renewal::Lost)
        }
    }

    async fn release(&self, lock: &ExecutionLock) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = RELEASE
            .key(Self::key(&lock.resource_id))
            .arg(token(lock))
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| EngineError::store("redis lock release", e))?;
        Ok(removed == 1)
    }

    async fn inspect(&self, resource: &ResourceId) -> Result<Option<ExecutionLock>> {
        let mut conn = self.conn.clone();
        let (token, pttl): (Option<String>, i64) = INSPECT
            .key(Self::key(resource))
            .invoke_async::<(Option<String>, i64)>(&mut conn)
            .await
            .map_err(|e| EngineError::store("redis lock inspect", e))?;

        let Some(token) = token else {
            return Ok(None);
        };
        if pttl <= 0 {
            return Ok(None);
        }
        Ok(parse_token(resource, &token, pttl, Utc::now()))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        let lock = ExecutionLock::new(
            ResourceId("trigger:x".into()),
            HolderId::new("host|42"),
            Duration::from_secs(30),
            now,
        );
        let parsed = parse_token(&lock.resource_id, &token(&lock), 30_000, now)
            .expect("parse");
        assert!(parsed.same_lease(&lock));
        assert_eq!(parsed.acquired_at, now);
        assert_eq!(parsed.expires_at, lock.expires_at);
    }

    #[test]
    fn garbage_token_is_ignored() {
        assert!(
            parse_token(&ResourceId("r".into()), "nope", 1_000, Utc::now()).is_none()
        );
    }

    /// Needs a live Redis at `TEMPO_TEST_REDIS_URL`.
    #[tokio::test]
    #[ignore]
    async fn redis_lock_excludes_second_holder() {
        let url = std::env::var("TEMPO_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let locks = RedisLockManager::connect(&url).await.expect("connect");
        let resource = ResourceId(format!("test:{}", Uuid::now_v7()));
        let ttl = Duration::from_secs(5);

        let lock = locks
            .acquire(&resource, &HolderId::new("a"), ttl)
            .await
            .unwrap()
            .into_lock()
            .expect("acquire");
        assert_eq!(
            locks.acquire(&resource, &HolderId::new("b"), ttl).await.unwrap(),
            Acquire::Denied
        );
        assert!(matches!(
            locks.heartbeat(&lock, ttl).await.unwrap(),
            Renewal::Extended(_)
        ));
        let seen = locks.inspect(&resource).await.unwrap().expect("held");
        assert!(seen.same_lease(&lock));
        assert!(locks.release(&lock).await.unwrap());
        assert!(locks.inspect(&resource).await.unwrap().is_none());
    }
}
