//! Logging initialisation for Tandem
//!
//! Library crates only emit `tracing` events. Applications call one of the
//! functions here once at startup to install a subscriber.

pub mod init;

pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing};
pub use tandem_config::{LogFormat, LogLevel, LoggingConfig};
