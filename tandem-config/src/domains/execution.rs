//! Per-module execution settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::Validatable;

/// How calls through a loaded module are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Reserve a thread exclusively for each call and each instantiated object
    pub parallel: bool,

    /// Give up waiting for a thread after this long
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl ExecutionSettings {
    pub fn parallel() -> Self {
        Self {
            parallel: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Validatable for ExecutionSettings {
    fn validate(&self) -> ConfigResult<()> {
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(self.validation_error("timeout must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "execution"
    }
}
