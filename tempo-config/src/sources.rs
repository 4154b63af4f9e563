use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempo_core::config::EngineConfig;

use super::models::{LockBackend, SeedTrigger, StoreBackend};

/// Raw configuration as written in `tempo.toml`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub backends: FileBackendConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, rename = "trigger")]
    pub triggers: Vec<SeedTrigger>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBackendConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locks: Option<LockBackend>,
}

/// Environment-derived overrides. Values that fail to parse are kept in
/// `rejected` so the loader can report them instead of silently dropping them.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub http_addr: Option<String>,
    pub store: Option<StoreBackend>,
    pub locks: Option<LockBackend>,
    pub slots: Option<usize>,
    pub poll_interval: Option<Duration>,
    pub worker_id: Option<String>,
    pub rejected: Vec<RejectedVar>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedVar {
    pub name: &'static str,
    pub value: String,
    pub reason: String,
}

impl EnvConfig {
    /// Reads overrides from the process environment.
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads overrides from an explicit key/value set.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name).filter(|value| !value.trim().is_empty())
        };
        let mut env_config = Self::default();

        env_config.config_path = var("TEMPO_CONFIG").map(PathBuf::from);
        env_config.database_url =
            var("TEMPO_DATABASE_URL").or_else(|| var("DATABASE_URL"));
        env_config.redis_url = var("TEMPO_REDIS_URL").or_else(|| var("REDIS_URL"));
        env_config.http_addr = var("TEMPO_HTTP_ADDR");
        env_config.worker_id = var("TEMPO_WORKER_ID");

        env_config.store = env_config.parse("TEMPO_STORE", var("TEMPO_STORE"), |raw| {
            raw.parse::<StoreBackend>()
        });
        env_config.locks = env_config.parse("TEMPO_LOCKS", var("TEMPO_LOCKS"), |raw| {
            raw.parse::<LockBackend>()
        });
        env_config.slots = env_config.parse("TEMPO_SLOTS", var("TEMPO_SLOTS"), |raw| {
            raw.trim().parse::<usize>().map_err(|err| err.to_string())
        });
        env_config.poll_interval = env_config.parse(
            "TEMPO_POLL_INTERVAL",
            var("TEMPO_POLL_INTERVAL"),
            |raw| humantime::parse_duration(raw.trim()).map_err(|err| err.to_string()),
        );

        env_config
    }

    fn parse<T>(
        &mut self,
        name: &'static str,
        raw: Option<String>,
        parse: impl FnOnce(&str) -> Result<T, String>,
    ) -> Option<T> {
        let raw = raw?;
        match parse(&raw) {
            Ok(value) => Some(value),
            Err(reason) => {
                self.rejected.push(RejectedVar {
                    name,
                    value: raw,
                    reason,
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_read_and_bad_values_reported() {
        let env = EnvConfig::from_pairs([
            ("TEMPO_SLOTS", "16"),
            ("TEMPO_POLL_INTERVAL", "250ms"),
            ("TEMPO_LOCKS", "zookeeper"),
            ("TEMPO_WORKER_ID", "  "),
            ("DATABASE_URL", "postgres://fallback/tempo"),
        ]);

        assert_eq!(env.slots, Some(16));
        assert_eq!(env.poll_interval, Some(Duration::from_millis(250)));
        assert_eq!(env.locks, None);
        assert_eq!(env.worker_id, None);
        assert_eq!(env.database_url.as_deref(), Some("postgres://fallback/tempo"));
        assert_eq!(env.rejected.len(), 1);
        assert_eq!(env.rejected[0].name, "TEMPO_LOCKS");
    }

    #[test]
    fn prefixed_database_url_wins() {
        let env = EnvConfig::from_pairs([
            ("DATABASE_URL", "postgres://generic/db"),
            ("TEMPO_DATABASE_URL", "postgres://tempo/db"),
        ]);
        assert_eq!(env.database_url.as_deref(), Some("postgres://tempo/db"));
    }
}
