//! Configuration for Tandem
//!
//! Thread pool limits, per-module execution settings and logging, with
//! validation, defaults, YAML files and environment variable overrides.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use domains::{
    concurrency::{ConcurrencyConfig, PartialConcurrencyConfig},
    execution::ExecutionSettings,
    logging::{LogFormat, LogLevel, LoggingConfig},
    TandemConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;
