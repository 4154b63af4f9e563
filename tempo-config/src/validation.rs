use thiserror::Error;

use super::models::{LockBackend, StoreBackend, TempoConfig};

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{backend} backend selected but no database URL is configured")]
    MissingDatabaseUrl { backend: &'static str },
    #[error("redis lock backend selected but no redis URL is configured")]
    MissingRedisUrl,
    #[error("database URL must start with postgres:// or postgresql://")]
    UnsupportedDatabaseUrl,
    #[error("duplicate seed trigger name '{name}'")]
    DuplicateSeedTrigger { name: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

/// Rejects backend selections that cannot start and flags ones that start
/// but will not coordinate across workers.
pub fn apply_guard_rails(config: &TempoConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let backends = config.backends;

    let needs_database =
        backends.store == StoreBackend::Postgres || backends.locks == LockBackend::Postgres;
    if needs_database {
        let Some(url) = config.database.url.as_deref() else {
            let backend = if backends.store == StoreBackend::Postgres {
                "postgres store"
            } else {
                "postgres lock"
            };
            return Err(ConfigGuardRailError::MissingDatabaseUrl { backend });
        };
        if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
            return Err(ConfigGuardRailError::UnsupportedDatabaseUrl);
        }
    }

    if backends.locks == LockBackend::Redis && config.redis.is_none() {
        return Err(ConfigGuardRailError::MissingRedisUrl);
    }

    match (backends.store, backends.locks) {
        (StoreBackend::Memory, _) => warnings.push_with_hint(
            "memory store keeps triggers and job history in this process only",
            "set TEMPO_DATABASE_URL to share state between workers",
        ),
        (StoreBackend::Postgres, LockBackend::Memory) => warnings.push_with_hint(
            "shared postgres store with process-local locks: concurrent workers will not exclude each other",
            "use the postgres or redis lock backend when running more than one worker",
        ),
        _ => {}
    }

    let mut seen = std::collections::HashSet::new();
    for seed in &config.triggers {
        if !seen.insert(seed.name.as_str()) {
            return Err(ConfigGuardRailError::DuplicateSeedTrigger {
                name: seed.name.clone(),
            });
        }
    }
    if !config.triggers.is_empty() && backends.store != StoreBackend::Memory {
        warnings.push_with_hint(
            format!(
                "{} seed trigger(s) ignored: seeding only applies to the memory store",
                config.triggers.len()
            ),
            "create triggers through the trigger management service instead",
        );
    }

    Ok(warnings)
}
