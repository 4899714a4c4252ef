//! Config sections, one module each

pub mod concurrency;
pub mod execution;
pub mod logging;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Everything a `Master` can be configured with.
///
/// Every section falls back to its defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    /// Pool limits and timers
    pub concurrency: concurrency::ConcurrencyConfig,

    /// Settings for modules loaded without explicit ones
    pub execution: execution::ExecutionSettings,

    pub logging: logging::LoggingConfig,
}

impl TandemConfig {
    /// Validate every section, stopping at the first failure
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.concurrency.validate()?;
        self.execution.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// The defaults rendered as YAML, as a starting point for a config file
    pub fn generate_sample() -> String {
        serde_yaml::to_string(&TandemConfig::default())
            .unwrap_or_else(|e| format!("# could not render defaults: {}\n", e))
    }
}
