//! Wires configured backends into an [`EngineRuntime`].

use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tempo_config::{LockBackend, SeedTrigger, StoreBackend, TempoConfig};
use tempo_core::store::{JobStore, TriggerStore};
use tempo_core::{
    EngineRuntime, HandlerRegistry, LockManager, MemoryLockManager, MemoryStore,
    PostgresLockManager, PostgresStore, RedisLockManager,
};
use tracing::{info, warn};

/// Storage and lock ports the engine runs against.
pub struct Backends {
    pub triggers: Arc<dyn TriggerStore>,
    pub jobs: Arc<dyn JobStore>,
    pub locks: Arc<dyn LockManager>,
    /// Set when the memory store is in use, for seeding.
    pub memory: Option<Arc<MemoryStore>>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("locks", &self.locks.backend())
            .field("memory_store", &self.memory.is_some())
            .finish()
    }
}

pub async fn connect_pool(config: &TempoConfig) -> anyhow::Result<PgPool> {
    let url = config
        .database
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("no database URL configured"))?;
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")
}

/// Runs the embedded migrations against the configured database.
pub async fn migrate(config: &TempoConfig) -> anyhow::Result<()> {
    let pool = connect_pool(config).await?;
    PostgresStore::new(pool)
        .await?
        .migrate()
        .await
        .context("database migration failed")?;
    info!("database migrations applied");
    Ok(())
}

pub async fn connect_backends(config: &TempoConfig, auto_migrate: bool) -> anyhow::Result<Backends> {
    let backends = config.backends;
    let needs_pool =
        backends.store == StoreBackend::Postgres || backends.locks == LockBackend::Postgres;

    let postgres = if needs_pool {
        let store = PostgresStore::new(connect_pool(config).await?).await?;
        if auto_migrate {
            store.migrate().await.context("database migration failed")?;
        }
        Some(Arc::new(store))
    } else {
        None
    };

    let (triggers, jobs, memory): (Arc<dyn TriggerStore>, Arc<dyn JobStore>, _) =
        match (backends.store, &postgres) {
            (StoreBackend::Postgres, Some(store)) => (store.clone(), store.clone(), None),
            _ => {
                let store = Arc::new(MemoryStore::new());
                (store.clone(), store.clone(), Some(store))
            }
        };

    let locks: Arc<dyn LockManager> = match (backends.locks, &postgres) {
        (LockBackend::Postgres, Some(store)) => {
            Arc::new(PostgresLockManager::new(store.pool().clone()))
        }
        (LockBackend::Redis, _) => {
            let redis = config
                .redis
                .as_ref()
                .ok_or_else(|| anyhow!("redis lock backend selected without a redis URL"))?;
            Arc::new(
                RedisLockManager::connect(&redis.url)
                    .await
                    .context("failed to connect to Redis")?,
            )
        }
        _ => Arc::new(MemoryLockManager::new()),
    };

    info!(store = %backends.store, locks = %backends.locks, "backends connected");
    Ok(Backends {
        triggers,
        jobs,
        locks,
        memory,
    })
}

/// Inserts configured seed triggers into the memory store.
pub async fn seed_triggers(store: &MemoryStore, seeds: &[SeedTrigger]) -> anyhow::Result<usize> {
    let now = Utc::now();
    for seed in seeds {
        let trigger = seed.to_trigger(now)?;
        info!(
            trigger = %trigger.id,
            name = %seed.name,
            task_type = %trigger.execution.task_type,
            next_due = ?trigger.next_due_at,
            "seeded trigger"
        );
        store.upsert_trigger(trigger).await;
    }
    Ok(seeds.len())
}

pub async fn build_engine(
    config: &TempoConfig,
    backends: Backends,
    handlers: HandlerRegistry,
) -> anyhow::Result<EngineRuntime> {
    if let Some(store) = &backends.memory {
        seed_triggers(store, &config.triggers).await?;
    } else if !config.triggers.is_empty() {
        warn!(count = config.triggers.len(), "seed triggers ignored for the postgres store");
    }

    let engine = EngineRuntime::builder(config.engine.clone())
        .with_triggers(backends.triggers)
        .with_jobs(backends.jobs)
        .with_locks(backends.locks)
        .with_handlers(handlers)
        .build()
        .context("failed to build engine")?;
    Ok(engine)
}
