//! Configuration errors

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read Tandem config file: {0}")]
    FileReadError(#[from] std::io::Error),

    #[error("Invalid Tandem config YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A `TANDEM_*` override that does not parse
    #[error("Bad environment override: {0}")]
    EnvError(String),

    /// A section whose values break its own rules
    #[error("Invalid {domain} settings: {message}")]
    DomainError { domain: String, message: String },
}
