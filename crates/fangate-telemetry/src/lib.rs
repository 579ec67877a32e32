//! Structured logging and Prometheus metrics.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Logging init failed: {0}")]
    LoggingInit(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
