//! Error types for fangate-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid tick: {0}")]
    InvalidTick(String),

    #[error("Invalid bar: {0}")]
    InvalidBar(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Insufficient history: {0}")]
    InsufficientHistory(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
