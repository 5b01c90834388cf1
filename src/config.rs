use log::LevelFilter;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_MAX_DEVICE_QUEUE_SIZE: usize = 200;
const DEFAULT_UUID_FALLBACK_DELAY_MS: u64 = 6000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote device records kept before the oldest unbonded one is dropped.
    pub max_device_queue_size: usize,
    /// How long to wait for SDP before announcing whatever UUIDs are cached.
    pub uuid_fallback_delay_ms: u64,
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_device_queue_size: DEFAULT_MAX_DEVICE_QUEUE_SIZE,
            uuid_fallback_delay_ms: DEFAULT_UUID_FALLBACK_DELAY_MS,
            log_level: None,
        }
    }
}

impl Config {
    pub fn from_json_str(config: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_str(config)?;
        config.log_level_filter()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        Config::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Like `load`, but a missing or broken file falls back to the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Config {
        Config::load(path).unwrap_or_else(|e| {
            log::info!("Using default config: {}", e);
            Config::default()
        })
    }

    pub fn uuid_fallback_delay(&self) -> Duration {
        Duration::from_millis(self.uuid_fallback_delay_ms)
    }

    /// Level to log at. Unset means info.
    pub fn log_level_filter(&self) -> Result<LevelFilter, ConfigError> {
        match &self.log_level {
            None => Ok(LevelFilter::Info),
            Some(level) => level
                .parse::<LevelFilter>()
                .map_err(|_| ConfigError::InvalidLogLevel(level.clone())),
        }
    }
}
