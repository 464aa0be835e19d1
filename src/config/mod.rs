mod file_config;

pub use file_config::{FileConfig, QueueConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_QUEUE_NAME: &str = "default";
pub const DEFAULT_EXPIRY_SECS: u64 = 60;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub default_queue: Option<String>,
    pub expiry_secs: Option<u64>,
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub queue: QueueSettings,
}

/// Settings of a queue engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Queue used when an operation does not name one.
    pub default_queue: String,
    /// Visibility timeout: a reservation older than this is considered
    /// abandoned and the job can be reserved again.
    pub expiry_secs: u64,
    /// How long a store operation waits for another connection's lock.
    pub busy_timeout_ms: u64,
}

impl QueueSettings {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE_NAME.to_string(),
            expiry_secs: DEFAULT_EXPIRY_SECS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db or in config file")
            })?;

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let defaults = QueueSettings::default();
        let queue_file = file.queue.unwrap_or_default();
        let queue = QueueSettings {
            default_queue: queue_file
                .default_queue
                .or_else(|| cli.default_queue.clone())
                .unwrap_or(defaults.default_queue),
            expiry_secs: queue_file
                .expiry_secs
                .or(cli.expiry_secs)
                .unwrap_or(defaults.expiry_secs),
            busy_timeout_ms: queue_file
                .busy_timeout_ms
                .or(cli.busy_timeout_ms)
                .unwrap_or(defaults.busy_timeout_ms),
        };

        if queue.default_queue.trim().is_empty() {
            bail!("default_queue must not be empty");
        }

        Ok(Self { db_path, queue })
    }
}
