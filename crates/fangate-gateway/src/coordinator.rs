//! Request coordination: coalescing and retry of bootstrap fetches.
//!
//! Concurrent `get_symbol_data_package` requests for the same
//! `(symbol, lookback)` share one upstream fetch; every waiter gets
//! the result. Rate-limit rejections retry with exponential backoff
//! before surfacing. Provider-B requests are not coalesced (a chart
//! subscription is cheap); their waiters are parked until the
//! session's package event arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use fangate_core::SymbolDataPackage;

use crate::registry::ClientId;
use crate::upstream::{FetchError, Upstream};

/// Coordinator configuration.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub fetch_timeout_ms: u64,
    /// Total attempts for rate-limited fetches.
    pub max_attempts: u32,
    /// Base retry delay; doubles per retry.
    pub retry_base_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 30_000,
            max_attempts: 3,
            retry_base_ms: 500,
        }
    }
}

/// Fetch outcomes, consumed by the gateway event loop.
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// A coalesced provider-A fetch succeeded.
    PackageReady {
        waiters: Vec<ClientId>,
        package: Box<SymbolDataPackage>,
    },
    /// A fetch (or chart subscription) failed after retries.
    PackageFailed {
        waiters: Vec<ClientId>,
        symbol: String,
        message: String,
    },
}

type Key = (String, usize);

/// Coalescing request coordinator.
pub struct RequestCoordinator {
    upstream: Arc<dyn Upstream>,
    config: CoordinatorConfig,
    pending: Mutex<HashMap<Key, Vec<ClientId>>>,
    /// Provider-B waiters parked until the session emits the package.
    pending_chart: Mutex<HashMap<String, Vec<ClientId>>>,
    event_tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl RequestCoordinator {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        config: CoordinatorConfig,
        event_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            upstream,
            config,
            pending: Mutex::new(HashMap::new()),
            pending_chart: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Request a provider-A bootstrap for a client. The first request
    /// for a key starts the fetch; later requests join its waiter list.
    pub fn request_package(self: &Arc<Self>, symbol: &str, lookback: usize, client: ClientId) {
        let key = (symbol.to_string(), lookback);
        {
            let mut pending = self.pending.lock();
            if let Some(waiters) = pending.get_mut(&key) {
                waiters.push(client);
                debug!(symbol, lookback, "Joined in-flight fetch");
                return;
            }
            pending.insert(key.clone(), vec![client]);
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.fetch_with_retry(&key.0, key.1).await;
            let waiters = this.pending.lock().remove(&key).unwrap_or_default();
            let event = match result {
                Ok(package) => CoordinatorEvent::PackageReady {
                    waiters,
                    package: Box::new(package),
                },
                Err(e) => CoordinatorEvent::PackageFailed {
                    waiters,
                    symbol: key.0.clone(),
                    message: e.to_string(),
                },
            };
            let _ = this.event_tx.send(event);
        });
    }

    /// Request a provider-B bootstrap: park the waiter and start the
    /// chart subscription. No coalescing; a re-request re-subscribes
    /// and re-runs the bootstrap.
    pub fn request_chart(self: &Arc<Self>, symbol: &str, lookback: usize, client: ClientId) {
        self.pending_chart
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push(client);

        let this = Arc::clone(self);
        let symbol = symbol.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.upstream.subscribe_chart(&symbol, lookback).await {
                warn!(symbol = %symbol, error = %e, "Chart subscribe failed");
                let waiters = this.take_chart_waiters(&symbol);
                let _ = this.event_tx.send(CoordinatorEvent::PackageFailed {
                    waiters,
                    symbol,
                    message: e.to_string(),
                });
            }
        });
    }

    /// Drain the parked provider-B waiters for a symbol; called when
    /// the session's package (or a symbol error) arrives.
    pub fn take_chart_waiters(&self, symbol: &str) -> Vec<ClientId> {
        self.pending_chart.lock().remove(symbol).unwrap_or_default()
    }

    async fn fetch_with_retry(
        &self,
        symbol: &str,
        lookback: usize,
    ) -> Result<SymbolDataPackage, FetchError> {
        let timeout = Duration::from_millis(self.config.fetch_timeout_ms);
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(
                timeout,
                self.upstream.fetch_package(symbol, lookback),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            };

            match result {
                Ok(package) => return Ok(package),
                Err(e @ FetchError::RateLimited(_)) if attempt + 1 < self.config.max_attempts => {
                    let delay =
                        Duration::from_millis(self.config.retry_base_ms * (1u64 << attempt));
                    attempt += 1;
                    warn!(
                        symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Rate limited, retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
