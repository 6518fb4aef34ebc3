//! Error types and reporting for pipeline stations.

use thiserror::Error;

/// Outcome of a failed `Station::process` call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StationError {
    /// Recoverable error that allows the station to continue processing.
    #[error("Recoverable error: {0}")]
    Recoverable(String),
    /// Fatal error that requires the station to shut down.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Where station threads send their errors.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, station: &str, error: &StationError);
}

/// Reporter that forwards to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, station: &str, error: &StationError) {
        match error {
            StationError::Recoverable(_) => log::warn!("[{}] {}", station, error),
            StationError::Fatal(_) => log::error!("[{}] {}", station, error),
        }
    }
}
