//! Upstream seam between the gateway and the provider sessions.
//!
//! The gateway talks to upstreams through this trait so the
//! coordinator can be exercised against a mock; the binary wires it to
//! the two real sessions.

use async_trait::async_trait;
use thiserror::Error;

use fangate_core::{Source, SymbolDataPackage};

use crate::wire::ReinitSource;

/// Errors the upstream seam can surface to the coordinator.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Transient upstream rejection; retried with backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("fetch timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

/// Operations the gateway needs from the upstream sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Provider-A bootstrap fetch (coalesced by the coordinator).
    async fn fetch_package(
        &self,
        symbol: &str,
        adr_lookback_days: usize,
    ) -> Result<SymbolDataPackage, FetchError>;

    /// Provider-B chart subscription; the package arrives later as a
    /// session event.
    async fn subscribe_chart(&self, symbol: &str, lookback_days: usize) -> Result<(), FetchError>;

    /// Live quote subscription for a `(symbol, source)` key.
    async fn subscribe_quotes(&self, symbol: &str, source: Source) -> Result<(), FetchError>;

    /// Live quote unsubscribe when a key drops to zero subscribers.
    async fn unsubscribe_quotes(&self, symbol: &str, source: Source) -> Result<(), FetchError>;

    /// Session-level live M1-bar subscription.
    async fn subscribe_m1(&self, symbol: &str, source: Source) -> Result<(), FetchError>;

    /// Drop a session-level live M1-bar subscription.
    async fn unsubscribe_m1(&self, symbol: &str, source: Source) -> Result<(), FetchError>;

    /// Manual session reinitialization.
    async fn reinit(&self, source: ReinitSource);

    /// Symbols the provider-A catalog knows; used to route bootstrap
    /// requests and reported to clients in status messages.
    fn available_symbols(&self) -> Vec<String>;

    /// Whether a symbol is served by provider A (catalog hit) or falls
    /// through to provider B.
    fn is_ctrader_symbol(&self, symbol: &str) -> bool;
}
