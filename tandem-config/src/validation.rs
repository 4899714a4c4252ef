//! Per-section validation

use crate::error::{ConfigError, ConfigResult};

/// A config section that can check its own values
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    /// Section name used in error messages
    fn domain_name(&self) -> &'static str;

    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Reject zero and negative values of a numeric setting
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value > T::default() {
        return Ok(());
    }
    Err(ConfigError::DomainError {
        domain: domain.to_string(),
        message: format!("{} must be at least 1, got {}", field_name, value),
    })
}
