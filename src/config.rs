use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub indexer: IndexerConfig,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
    pub rules: RulesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Messages fetched and committed per batch.
    pub batch_size: i64,
    /// Messages per minute for newly created indexer state.
    pub default_speed: i64,
    /// Retries of one failing batch before the indexer gives up.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl IndexerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            default_speed: 100,
            max_retries: 3,
            retry_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    /// Where the command-line scheduler drops sent messages as `.eml` files.
    pub outbox_dir: String,
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            outbox_dir: "outbox".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub purge_deleted_after_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            purge_deleted_after_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// How many recent messages a rule dry run looks at.
    pub dry_run_limit: i64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self { dry_run_limit: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "mailstore=info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:mailstore.db".to_string(),
            indexer: IndexerConfig::default(),
            scheduler: SchedulerConfig::default(),
            retention: RetentionConfig::default(),
            rules: RulesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Reads `settings.toml` from the working directory, falling back to
    /// defaults when it is missing or unreadable.
    pub fn load() -> Self {
        use std::fs;
        if let Ok(content) = fs::read_to_string(SETTINGS_FILE) {
            if let Ok(config) = Self::parse(&content) {
                return config;
            }
        }
        Self::default()
    }

    /// Like [`Config::load`] but for an explicit path, where a missing or
    /// broken file is an error.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.indexer.batch_size <= 0 {
            return Err(StoreError::Config("indexer.batch_size must be positive".to_string()));
        }
        if self.indexer.default_speed <= 0 {
            return Err(StoreError::Config("indexer.default_speed must be positive".to_string()));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(StoreError::Config("scheduler.tick_secs must be positive".to_string()));
        }
        if self.scheduler.outbox_dir.trim().is_empty() {
            return Err(StoreError::Config("scheduler.outbox_dir must not be empty".to_string()));
        }
        if self.retention.purge_deleted_after_days < 0 {
            return Err(StoreError::Config(
                "retention.purge_deleted_after_days must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
