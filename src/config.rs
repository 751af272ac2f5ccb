use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Settings for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub workers: usize,
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            workers: 4,
            thread_name_prefix: "pool-worker".to_string(),
        }
    }
}

/// Settings for the demo driver and its simulated stages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub source: String,
    pub fetch_delay_ms: u64,
    pub process_delay_ms: u64,
    pub other_work_ms: u64,
    pub wait_timeout_ms: Option<u64>,
    pub fail_fetch: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            source: "Database".to_string(),
            fetch_delay_ms: 2000,
            process_delay_ms: 1000,
            other_work_ms: 500,
            wait_timeout_ms: None,
            fail_fetch: false,
        }
    }
}

impl DriverConfig {
    pub fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_delay_ms)
    }

    pub fn process_delay(&self) -> Duration {
        Duration::from_millis(self.process_delay_ms)
    }

    pub fn other_work(&self) -> Duration {
        Duration::from_millis(self.other_work_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DemoConfig {
    pub pool: PoolConfig,
    pub driver: DriverConfig,
}

impl DemoConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DemoConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::invalid("pool.workers", "must be at least 1"));
        }
        if self.pool.thread_name_prefix.trim().is_empty() {
            return Err(ConfigError::invalid(
                "pool.thread_name_prefix",
                "must not be empty",
            ));
        }
        if self.driver.source.trim().is_empty() {
            return Err(ConfigError::invalid("driver.source", "must not be empty"));
        }
        Ok(())
    }
}
