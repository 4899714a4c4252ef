//! Configuration loading and environment variable handling

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::concurrency::ConcurrencyConfig;
use crate::domains::execution::ExecutionSettings;
use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::TandemConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "TANDEM".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<TandemConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: TandemConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<TandemConfig> {
        let mut config = TandemConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<TandemConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut TandemConfig) -> ConfigResult<()> {
        self.apply_concurrency_overrides(&mut config.concurrency)?;
        self.apply_execution_overrides(&mut config.execution)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_concurrency_overrides(&self, config: &mut ConcurrencyConfig) -> ConfigResult<()> {
        if let Some(max_threads) = self.parse_env_var("MAX_THREADS")? {
            config.max_threads = max_threads;
        }

        if let Some(min_threads) = self.parse_env_var("MIN_THREADS")? {
            config.min_threads = min_threads;
        }

        if let Some(timeout) = self.timeout_env_var("THREAD_ALLOCATION_TIMEOUT_MS")? {
            config.thread_allocation_timeout = timeout;
        }

        if let Some(timeout) = self.timeout_env_var("THREAD_IDLE_TIMEOUT_MS")? {
            config.thread_idle_timeout = timeout;
        }

        if let Some(disabled) = self.parse_env_var("DISABLED")? {
            config.disabled = disabled;
        }

        Ok(())
    }

    fn apply_execution_overrides(&self, config: &mut ExecutionSettings) -> ConfigResult<()> {
        if let Some(parallel) = self.parse_env_var("PARALLEL")? {
            config.parallel = parallel;
        }
        Ok(())
    }

    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Milliseconds, or `infinite` to switch the timeout off
    fn timeout_env_var(&self, name: &str) -> ConfigResult<Option<Option<Duration>>> {
        let Ok(value) = self.get_env_var(name) else {
            return Ok(None);
        };
        if value.trim().eq_ignore_ascii_case("infinite") {
            return Ok(Some(None));
        }
        let millis: u64 = value
            .trim()
            .parse()
            .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
        Ok(Some(Some(Duration::from_millis(millis))))
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
