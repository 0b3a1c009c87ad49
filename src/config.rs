use std::fs;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::transfer::{CoordinatorConfig, WorkerConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL for the record stores
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoordinatorSettings {
    /// Deadline for each individual store call
    pub store_call_timeout_ms: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            store_call_timeout_ms: 5_000,
        }
    }
}

impl CoordinatorSettings {
    pub fn to_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            store_call_timeout: Duration::from_millis(self.store_call_timeout_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecoverySettings {
    pub scan_interval_secs: u64,
    /// Idle time after which a non-terminal transaction is considered stuck
    pub stale_threshold_secs: u64,
    pub batch_size: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            batch_size: 100,
        }
    }
}

impl RecoverySettings {
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            batch_size: self.batch_size,
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
