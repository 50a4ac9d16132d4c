//! CLI error type.

use thiserror::Error;
use fleetdrop::acquisition::AcquisitionError;
use fleetdrop::config::ConfigError;
use fleetdrop::logging::LoggingError;
use fleetdrop::serve::ServeError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Refresh failed: {0}")]
    Refresh(String),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Serve(#[from] ServeError),
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}
