//! TradingView session error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradingViewError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Symbol error for {symbol}: {message}")]
    Symbol { symbol: String, message: String },

    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TvResult<T> = Result<T, TradingViewError>;
