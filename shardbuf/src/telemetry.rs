// src/telemetry.rs
//! Logging setup for programs embedding the engine.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the caller. [`init_logging`] is the convenience path driven by the
//! `logging:` section of the configuration file.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ConfigError;

/// Installs a global `tracing-subscriber` fmt subscriber.
///
/// `RUST_LOG`, when set, overrides the configured level. `log` records are
/// forwarded through the subscriber's `tracing-log` bridge.
///
/// # Errors
///
/// `ConfigError::LoggingInit` if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
  let filter = EnvFilter::builder()
    .with_default_directive(config.level.into())
    .from_env_lossy();

  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_thread_names(true);

  let result = match config.format {
    LogFormat::Full => builder.try_init(),
    LogFormat::Compact => builder.compact().try_init(),
    LogFormat::Pretty => builder.pretty().try_init(),
  };
  result.map_err(|e| ConfigError::LoggingInit(e.to_string()))
}
