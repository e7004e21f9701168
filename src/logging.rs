//! Logging initialisation.
//!
//! Installs a `tracing-subscriber` registry filtered by `RUST_LOG` (falling
//! back to the configured level) with a pretty, compact or JSON formatter.
//! Events go to stderr so command output on stdout stays parseable.

use std::io;

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{ConfigError, HarnessConfig, LogFormat};

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The configured format is unknown.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The configured level is not a valid filter directive.
    #[error("invalid log level '{level}': {message}")]
    InvalidLevel {
        /// Rejected directive.
        level: String,
        /// Parser error message.
        message: String,
    },
    /// A global subscriber is already installed.
    #[error("failed to initialise {format:?} tracing subscriber: {message}")]
    Install {
        /// Format that was being installed.
        format: LogFormat,
        /// Installer error message.
        message: String,
    },
}

/// Builds the filter: `RUST_LOG` when set, otherwise `level`.
///
/// # Errors
///
/// Returns [`LoggingError::InvalidLevel`] when `level` does not parse.
pub fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|err| LoggingError::InvalidLevel {
        level: level.to_owned(),
        message: err.to_string(),
    })
}

/// Installs the global subscriber described by `config`.
///
/// Call once, before the first stage runs.
///
/// # Errors
///
/// Returns [`LoggingError`] when the configuration is invalid or a
/// subscriber is already installed.
pub fn init_logging(config: &HarnessConfig) -> Result<(), LoggingError> {
    let format = config.parsed_log_format()?;
    let filter = env_filter(&config.log_level)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(io::stderr))
            .try_init(),
    };
    installed.map_err(|err| LoggingError::Install {
        format,
        message: err.to_string(),
    })
}
