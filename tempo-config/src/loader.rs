use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tempo_core::EngineError;
use tracing::debug;

use super::models::{
    BackendConfig, ConfigMetadata, DatabaseConfig, LockBackend, RedisConfig, ServerConfig,
    StoreBackend, TempoConfig,
};
use super::sources::{EnvConfig, FileConfig};
use super::validation::{self, ConfigGuardRailError, ConfigWarnings};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["tempo.toml", "config/tempo.toml"];
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:7300";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Directory the default config locations are resolved against.
    pub search_root: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_search_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.options.search_root = Some(root.into());
        self
    }

    /// Loads `.env`, then the config file, then applies environment
    /// overrides from the process environment.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        self.load_from(EnvConfig::gather(), env_file_loaded)
    }

    /// Like [`ConfigLoader::load`] but with caller-supplied overrides and no
    /// `.env` handling.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        self.load_from(env, false)
    }

    fn load_from(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) =
            self.compose_config(file_config, env, config_path, env_file_loaded)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let source = ConfigPathSource {
            explicit: self.options.config_path.clone(),
            env: env.config_path.clone(),
            default: self.default_location(),
        };

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), ?provenance, "loaded configuration file");

        Ok((Some(file_config), Some(path)))
    }

    fn default_location(&self) -> Option<PathBuf> {
        let root = self.options.search_root.as_deref().unwrap_or(Path::new(""));
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|candidate| candidate.exists())
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
    ) -> Result<(TempoConfig, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if file_config.is_none() {
            warnings.push_with_hint(
                "No tempo.toml detected; using defaults and environment variables",
                "create tempo.toml or point TEMPO_CONFIG at one",
            );
        }
        for rejected in &env.rejected {
            warnings.push(format!(
                "ignoring {}={:?}: {}",
                rejected.name, rejected.value, rejected.reason
            ));
        }

        let FileConfig {
            server: file_server,
            database: file_database,
            redis: file_redis,
            backends: file_backends,
            engine: mut engine,
            triggers,
        } = file_config.unwrap_or_default();

        let raw_addr = env
            .http_addr
            .clone()
            .or(file_server.http_addr)
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
        let http_addr: SocketAddr = raw_addr
            .parse()
            .map_err(|_| ConfigLoadError::InvalidHttpAddr { value: raw_addr })?;

        let database = DatabaseConfig {
            url: env
                .database_url
                .clone()
                .or(file_database.url.filter(|url| !url.trim().is_empty())),
            max_connections: file_database
                .max_connections
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
        };

        let redis = env
            .redis_url
            .clone()
            .map(|url| RedisConfig { url })
            .or_else(|| file_redis.map(|r| RedisConfig { url: r.url }));

        let store = env.store.or(file_backends.store).unwrap_or(if database.url.is_some() {
            StoreBackend::Postgres
        } else {
            StoreBackend::Memory
        });
        let locks = env.locks.or(file_backends.locks).unwrap_or(if redis.is_some() {
            LockBackend::Redis
        } else if database.url.is_some() {
            LockBackend::Postgres
        } else {
            LockBackend::Memory
        });

        if let Some(slots) = env.slots {
            engine.executor.slots = slots;
        }
        if let Some(interval) = env.poll_interval {
            engine.queue.poll_interval_ms = duration_ms(interval);
        }
        if let Some(worker_id) = env.worker_id.clone() {
            engine.executor.worker_id = Some(worker_id);
        }
        engine.validate().map_err(ConfigLoadError::Engine)?;

        let config = TempoConfig {
            server: ServerConfig { http_addr },
            database,
            redis,
            backends: BackendConfig { store, locks },
            engine,
            triggers,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        };

        warnings.extend(validation::apply_guard_rails(&config)?);
        Ok((config, warnings))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid HTTP bind address '{value}'")]
    InvalidHttpAddr { value: String },
    #[error("invalid engine configuration")]
    Engine(#[source] EngineError),
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        self.default
            .as_ref()
            .map(|path| (path.clone(), ConfigPathProvenance::Default))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(self, ConfigPathProvenance::Explicit | ConfigPathProvenance::Env)
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: TempoConfig,
    pub warnings: ConfigWarnings,
}
