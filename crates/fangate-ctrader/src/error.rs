//! cTrader session error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CtraderError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Insufficient history for {symbol}: {got} daily bars")]
    InsufficientHistory { symbol: String, got: usize },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Upstream error {code}: {description}")]
    Upstream { code: String, description: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] fangate_codec::CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CtraderError {
    /// Transient upstream rejections that warrant a local retry with
    /// backoff before surfacing to clients.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            Self::Upstream { code, .. }
                if code == "REQUEST_FREQUENCY_EXCEEDED" || code == "BLOCKED_PAYLOAD_TYPE"
        )
    }
}

pub type CtraderResult<T> = Result<T, CtraderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_classification() {
        let rate = CtraderError::Upstream {
            code: "REQUEST_FREQUENCY_EXCEEDED".to_string(),
            description: "slow down".to_string(),
        };
        let blocked = CtraderError::Upstream {
            code: "BLOCKED_PAYLOAD_TYPE".to_string(),
            description: "blocked".to_string(),
        };
        let other = CtraderError::Upstream {
            code: "SYMBOL_NOT_FOUND".to_string(),
            description: "?".to_string(),
        };
        assert!(rate.is_rate_limit());
        assert!(blocked.is_rate_limit());
        assert!(!other.is_rate_limit());
        assert!(!CtraderError::NotConnected.is_rate_limit());
    }
}
