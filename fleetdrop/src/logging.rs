//! Logging initialisation.
//!
//! Console output always goes to stderr. When a log directory is given, a
//! daily-rolling file (`fleetdrop.log.YYYY-MM-DD`) is written as well
//! through a non-blocking writer; keep the returned guard alive for the
//! lifetime of the process so buffered lines are flushed on exit.
//! File timestamps use the local offset.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Log file name prefix.
pub const LOG_FILE_PREFIX: &str = "fleetdrop.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

/// Build the filter: `RUST_LOG`, else `configured`, else [`DEFAULT_LOG_FILTER`].
pub fn build_filter(configured: Option<&str>) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = configured.unwrap_or(DEFAULT_LOG_FILTER);
    EnvFilter::try_new(directive).map_err(|e| LoggingError::InvalidFilter {
        filter: directive.to_string(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber.
pub fn init_logging(
    directory: Option<&Path>,
    filter: Option<&str>,
) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = build_filter(filter)?;
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_timer(LocalTime::rfc_3339())
                .with_ansi(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(guard)
}
