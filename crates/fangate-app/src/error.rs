//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] fangate_telemetry::TelemetryError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] fangate_gateway::GatewayError),
}

pub type AppResult<T> = Result<T, AppError>;
