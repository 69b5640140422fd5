//! # Configuration
//!
//! TOML configuration for the `roomcast` binary. Every section has defaults,
//! so a partial file is enough:
//!
//! - [`StorageConfig`]: where the sled database lives and whether each write is flushed
//! - [`FanoutConfig`]: push topic, per-user channel capacity, body size limit
//! - [`TaskConfig`]: background side-effect queue
//! - [`LoggingConfig`]: level and optional log file
//!
//! ```rust,no_run
//! use roomcast::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("roomcast.toml").await?;
//!     let config = Config::load("roomcast.toml").await?;
//!     println!("data dir: {}", config.storage.data_dir);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::fanout::orchestrator::DEFAULT_MAX_BODY_BYTES;
use crate::fanout::MESSAGES_TOPIC;
use crate::tasks::TaskQueueConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Flush sled after every write instead of relying on its background flusher.
    #[serde(default)]
    pub flush_on_write: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            flush_on_write: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    #[serde(default = "default_push_topic")]
    pub push_topic: String,
    /// Pending pushes per connected user before further pushes are skipped.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_push_topic() -> String {
    MESSAGES_TOPIC.to_string()
}

fn default_channel_capacity() -> usize {
    64
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            push_topic: default_push_topic(),
            channel_capacity: default_channel_capacity(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

fn default_max_queue() -> usize {
    256
}

fn default_stats_interval_ms() -> u64 {
    60_000
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_queue: default_max_queue(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

impl TaskConfig {
    pub fn queue_config(&self) -> TaskQueueConfig {
        TaskQueueConfig {
            max_queue: self.max_queue,
            stats_interval_ms: self.stats_interval_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.trim().is_empty() {
            bail!("storage.data_dir must not be empty");
        }
        if !self.fanout.push_topic.starts_with('/') {
            bail!("fanout.push_topic must start with '/': {}", self.fanout.push_topic);
        }
        if self.fanout.channel_capacity == 0 {
            bail!("fanout.channel_capacity must be at least 1");
        }
        if self.fanout.max_body_bytes == 0 {
            bail!("fanout.max_body_bytes must be at least 1");
        }
        if self.tasks.max_queue == 0 {
            bail!("tasks.max_queue must be at least 1");
        }
        Ok(())
    }
}
