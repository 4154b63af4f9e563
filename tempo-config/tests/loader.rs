use std::fs;
use std::path::{Path, PathBuf};

use tempfile::tempdir;
use tempo_config::{
    ConfigGuardRailError, ConfigLoadError, ConfigLoader, EnvConfig, LockBackend, StoreBackend,
};
use tempo_model::{BackoffKind, ScheduleSpec};

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create config dir");
    }
    fs::write(&path, contents).expect("write config");
    path
}

fn no_env() -> EnvConfig {
    EnvConfig::from_pairs(std::iter::empty::<(String, String)>())
}

const FULL: &str = r#"
[server]
http_addr = "0.0.0.0:9000"

[database]
url = "postgres://tempo@db/tempo"
max_connections = 4

[redis]
url = "redis://cache:6379"

[engine.executor]
slots = 12

[engine.lock]
ttl_ms = 45000

[engine.retry]
default_policy = "gentle"

[engine.retry.policies.gentle]
max_attempts = 5
backoff = "fibonacci"
initial_delay_ms = 1000
max_delay_ms = 60000
"#;

#[test]
fn file_values_are_applied_over_defaults() {
    let dir = tempdir().unwrap();
    let path = write(dir.path(), "tempo.toml", FULL);

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(no_env())
        .expect("config loads");
    let config = load.config;

    assert_eq!(config.server.http_addr.port(), 9000);
    assert_eq!(config.database.max_connections, 4);
    assert_eq!(config.engine.executor.slots, 12);
    assert_eq!(config.engine.lock.ttl_ms, 45_000);
    // Untouched sections keep their defaults.
    assert_eq!(
        config.engine.queue.poll_interval_ms,
        tempo_core::config::QueueConfig::default().poll_interval_ms
    );
    let gentle = config.engine.retry.policy_for(None);
    assert_eq!(gentle.max_attempts, 5);
    assert_eq!(gentle.backoff, BackoffKind::Fibonacci);

    // A database and redis were configured, so both are used.
    assert_eq!(config.backends.store, StoreBackend::Postgres);
    assert_eq!(config.backends.locks, LockBackend::Redis);
    assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));
}

#[test]
fn environment_overrides_the_file() {
    let dir = tempdir().unwrap();
    let path = write(dir.path(), "tempo.toml", FULL);
    let env = EnvConfig::from_pairs([
        ("TEMPO_SLOTS", "2"),
        ("TEMPO_POLL_INTERVAL", "1s 500ms"),
        ("TEMPO_WORKER_ID", "worker-7"),
        ("TEMPO_HTTP_ADDR", "127.0.0.1:7444"),
        ("TEMPO_LOCKS", "postgres"),
    ]);

    let config = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env)
        .unwrap()
        .config;

    assert_eq!(config.engine.executor.slots, 2);
    assert_eq!(config.engine.queue.poll_interval_ms, 1_500);
    assert_eq!(config.engine.executor.worker_id.as_deref(), Some("worker-7"));
    assert_eq!(config.server.http_addr.port(), 7444);
    assert_eq!(config.backends.locks, LockBackend::Postgres);
}

#[test]
fn without_any_file_everything_runs_in_memory() {
    let dir = tempdir().unwrap();

    let load = ConfigLoader::new()
        .with_search_root(dir.path())
        .load_with_env(no_env())
        .unwrap();

    assert_eq!(load.config.backends.store, StoreBackend::Memory);
    assert_eq!(load.config.backends.locks, LockBackend::Memory);
    assert!(load.config.metadata.config_path.is_none());
    assert!(
        load.warnings
            .iter()
            .any(|w| w.message.contains("No tempo.toml"))
    );
}

#[test]
fn default_locations_are_searched() {
    let dir = tempdir().unwrap();
    let path = write(
        dir.path(),
        "config/tempo.toml",
        "[engine.executor]\nslots = 3\n",
    );

    let config = ConfigLoader::new()
        .with_search_root(dir.path())
        .load_with_env(no_env())
        .unwrap()
        .config;

    assert_eq!(config.engine.executor.slots, 3);
    assert_eq!(config.metadata.config_path, Some(path));
}

#[test]
fn config_path_from_environment_must_exist() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let env = EnvConfig::from_pairs([("TEMPO_CONFIG", missing.to_string_lossy().to_string())]);

    let err = ConfigLoader::new().load_with_env(env).unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { path } if path == missing));
}

#[test]
fn malformed_toml_reports_the_file() {
    let dir = tempdir().unwrap();
    let path = write(dir.path(), "tempo.toml", "[engine\nslots = ");

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(no_env())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Parse { .. }));
}

#[test]
fn invalid_engine_settings_are_rejected() {
    let dir = tempdir().unwrap();
    let path = write(dir.path(), "tempo.toml", "[engine.executor]\nslots = 0\n");

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(no_env())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Engine(_)));
}

#[test]
fn redis_locks_require_a_redis_url() {
    let dir = tempdir().unwrap();
    let path = write(dir.path(), "tempo.toml", "[backends]\nlocks = \"redis\"\n");

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(no_env())
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::MissingRedisUrl)
    ));
}

#[test]
fn unparseable_overrides_become_warnings() {
    let dir = tempdir().unwrap();
    let env = EnvConfig::from_pairs([("TEMPO_SLOTS", "lots")]);

    let load = ConfigLoader::new()
        .with_search_root(dir.path())
        .load_with_env(env)
        .unwrap();

    assert_eq!(
        load.config.engine.executor.slots,
        tempo_core::config::ExecutorConfig::default().slots
    );
    assert!(load.warnings.iter().any(|w| w.message.contains("TEMPO_SLOTS")));
}

#[test]
fn seed_triggers_are_parsed() {
    let dir = tempdir().unwrap();
    let path = write(
        dir.path(),
        "tempo.toml",
        r#"
[[trigger]]
name = "heartbeat"
schedule = { kind = "interval", every = 30, unit = "seconds" }
execution = { task_type = "noop", max_duration_ms = 5000, payload = { ping = true } }

[[trigger]]
name = "nightly-report"
priority = 5
schedule = { kind = "cron", expression = "0 2 * * *", timezone = "Europe/Berlin" }
execution = { task_type = "sleep", max_duration_ms = 60000, retry_policy = "default" }
"#,
    );

    let config = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(no_env())
        .unwrap()
        .config;

    assert_eq!(config.triggers.len(), 2);
    let nightly = &config.triggers[1];
    assert!(matches!(nightly.schedule, ScheduleSpec::Cron { .. }));
    assert_eq!(nightly.priority, 5);

    let now = chrono::Utc::now();
    let trigger = config.triggers[0].to_trigger(now).unwrap();
    assert_eq!(trigger.execution.payload["ping"], true);
    assert!(trigger.next_due_at.is_some());
}

#[test]
fn duplicate_seed_names_are_rejected() {
    let dir = tempdir().unwrap();
    let seed = r#"
[[trigger]]
name = "twice"
schedule = { kind = "manual" }
execution = { task_type = "noop", max_duration_ms = 1000 }
"#;
    let path = write(dir.path(), "tempo.toml", &format!("{seed}{seed}"));

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(no_env())
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::DuplicateSeedTrigger { .. })
    ));
}
