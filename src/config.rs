use chrono::Duration;
use log::{info, warn};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_DATA_DIR: &str = "polls";
const DEFAULT_DATABASE_URL: &str = "sqlite:polls.db";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_RETENTION_HOURS: i64 = 72;
const DEFAULT_SWEEP_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    File,
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "flatfile" | "json" => Ok(StorageBackend::File),
            "sqlite" | "sql" => Ok(StorageBackend::Sqlite),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    pub database_url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a closed poll stays in memory before the sweep reaps it.
    pub retention: Duration,
    pub sweep_interval: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub manager: ManagerConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::hours(DEFAULT_RETENTION_HOURS),
            sweep_interval: std::time::Duration::from_secs(DEFAULT_SWEEP_SECS),
        }
    }
}

impl AppConfig {
    /// Reads configuration from the environment, falling back to defaults for
    /// anything missing or unparsable.
    pub fn from_env() -> Self {
        let backend = env_parsed("POLL_STORAGE_BACKEND", StorageBackend::File);
        let data_dir = env::var("POLL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let max_connections = env_parsed("POLL_DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS).max(1);

        let retention_hours = env_parsed("POLL_RETENTION_HOURS", DEFAULT_RETENTION_HOURS).max(0);
        let sweep_secs = env_parsed("POLL_SWEEP_SECS", DEFAULT_SWEEP_SECS).max(1);

        info!(
            "Config loaded: backend={:?}, data_dir={}, retention={}h, sweep={}s",
            backend,
            data_dir.display(),
            retention_hours,
            sweep_secs
        );

        Self {
            storage: StorageConfig {
                backend,
                data_dir,
                database_url,
                max_connections,
            },
            manager: ManagerConfig {
                retention: Duration::hours(retention_hours),
                sweep_interval: std::time::Duration::from_secs(sweep_secs),
            },
        }
    }
}

fn env_parsed<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid value for {}: {:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
