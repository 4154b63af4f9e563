//! Configuration loading for tempo workers.
//!
//! Values are resolved in order of precedence: environment variables (after
//! `.env` is loaded), then `tempo.toml`, then built-in defaults. The engine
//! section of the file maps directly onto
//! [`tempo_core::config::EngineConfig`].
#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    BackendConfig, ConfigMetadata, DatabaseConfig, LockBackend, RedisConfig, SeedTrigger,
    ServerConfig, StoreBackend, TempoConfig,
};
pub use sources::EnvConfig;
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
