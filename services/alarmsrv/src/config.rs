//! alarmsrv configuration
//!
//! Loaded with figment: built-in defaults, then `config/alarmsrv.yaml` (or
//! the `--config` file), then `ALARMSRV_`-prefixed environment variables.
//! Nested keys are split on `__`, e.g. `ALARMSRV_QUEUE__PARTITIONS=4`.

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use voltage_alarm::AlarmEngineConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/alarmsrv.yaml";
pub const ENV_PREFIX: &str = "ALARMSRV_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

/// Alarm rules queue consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_pack_processing_timeout_ms")]
    pub pack_processing_timeout_ms: u64,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            partitions: default_partitions(),
            poll_interval_ms: default_poll_interval_ms(),
            pack_processing_timeout_ms: default_pack_processing_timeout_ms(),
            worker_threads: default_worker_threads(),
            max_poll_records: default_max_poll_records(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default = "default_harvest_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_harvest_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            max_connections: default_max_connections(),
        }
    }
}

/// Rules file with tenant rules and device/asset profile assignments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_rules_file")]
    pub rules_file: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            rules_file: default_rules_file(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_service_name() -> String {
    "alarmsrv".to_string()
}

fn default_topic() -> String {
    "tb_alarm_rules".to_string()
}

fn default_partitions() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    25
}

fn default_pack_processing_timeout_ms() -> u64 {
    60_000
}

fn default_worker_threads() -> usize {
    8
}

fn default_max_poll_records() -> usize {
    500
}

fn default_harvest_interval_secs() -> u64 {
    60
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "alarmsrv".to_string()
}

fn default_max_connections() -> u32 {
    16
}

fn default_rules_file() -> PathBuf {
    PathBuf::from("config/alarm_rules.yaml")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from `path` (or the default location) and the environment
    ///
    /// The default file is optional; an explicitly given one must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let figment = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("Configuration file not found: {}", path.display());
                }
                Self::figment(path)
            },
            None => Self::figment(Path::new(DEFAULT_CONFIG_PATH)),
        };

        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            bail!("service.name must not be empty");
        }
        if self.queue.topic.trim().is_empty() {
            bail!("queue.topic must not be empty");
        }
        if self.queue.partitions == 0 {
            bail!("queue.partitions must be greater than 0");
        }
        if self.queue.poll_interval_ms == 0 {
            bail!("queue.poll_interval_ms must be greater than 0");
        }
        if self.queue.pack_processing_timeout_ms == 0 {
            bail!("queue.pack_processing_timeout_ms must be greater than 0");
        }
        if self.queue.worker_threads == 0 {
            bail!("queue.worker_threads must be greater than 0");
        }
        if self.queue.max_poll_records == 0 {
            bail!("queue.max_poll_records must be greater than 0");
        }
        if self.harvest.interval_secs == 0 {
            bail!("harvest.interval_secs must be greater than 0");
        }
        if self.redis.url.trim().is_empty() {
            bail!("redis.url must not be empty");
        }
        if self.redis.max_connections == 0 {
            bail!("redis.max_connections must be greater than 0");
        }
        if self.catalog.rules_file.as_os_str().is_empty() {
            bail!("catalog.rules_file must not be empty");
        }
        Ok(())
    }

    pub fn engine_config(&self) -> AlarmEngineConfig {
        AlarmEngineConfig {
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            pack_processing_timeout: Duration::from_millis(self.queue.pack_processing_timeout_ms),
            harvest_interval: Duration::from_secs(self.harvest.interval_secs),
            worker_threads: self.queue.worker_threads,
        }
    }
}
