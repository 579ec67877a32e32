//! Bridges the gateway's upstream seam onto the two real sessions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use fangate_core::{Source, SymbolDataPackage};
use fangate_ctrader::{CtraderError, CtraderSession};
use fangate_gateway::{FetchError, ReinitSource, Upstream};
use fangate_tradingview::TradingViewSession;

/// Upstream adapter over the cTrader and TradingView sessions.
pub struct SessionUpstream {
    ctrader: Arc<CtraderSession>,
    tradingview: Arc<TradingViewSession>,
}

impl SessionUpstream {
    pub fn new(ctrader: Arc<CtraderSession>, tradingview: Arc<TradingViewSession>) -> Self {
        Self {
            ctrader,
            tradingview,
        }
    }
}

fn map_ctrader_err(e: CtraderError) -> FetchError {
    if e.is_rate_limit() {
        return FetchError::RateLimited(e.to_string());
    }
    match e {
        CtraderError::Timeout(_) => FetchError::Timeout,
        other => FetchError::Failed(other.to_string()),
    }
}

#[async_trait]
impl Upstream for SessionUpstream {
    async fn fetch_package(
        &self,
        symbol: &str,
        adr_lookback_days: usize,
    ) -> Result<SymbolDataPackage, FetchError> {
        self.ctrader
            .get_symbol_data_package(symbol, adr_lookback_days)
            .await
            .map_err(map_ctrader_err)
    }

    async fn subscribe_chart(&self, symbol: &str, lookback_days: usize) -> Result<(), FetchError> {
        self.tradingview
            .subscribe_to_symbol(symbol, lookback_days)
            .await
            .map_err(|e| FetchError::Failed(e.to_string()))
    }

    async fn subscribe_quotes(&self, symbol: &str, source: Source) -> Result<(), FetchError> {
        match source {
            Source::Ctrader => self
                .ctrader
                .subscribe_spots(symbol)
                .await
                .map_err(map_ctrader_err),
            // Chart subscriptions already stream ticks.
            Source::Tradingview => Ok(()),
        }
    }

    async fn unsubscribe_quotes(&self, symbol: &str, source: Source) -> Result<(), FetchError> {
        match source {
            Source::Ctrader => self
                .ctrader
                .unsubscribe_spots(symbol)
                .await
                .map_err(map_ctrader_err),
            Source::Tradingview => self
                .tradingview
                .unsubscribe_symbol(symbol)
                .await
                .map_err(|e| FetchError::Failed(e.to_string())),
        }
    }

    async fn subscribe_m1(&self, symbol: &str, source: Source) -> Result<(), FetchError> {
        match source {
            Source::Ctrader => self
                .ctrader
                .subscribe_m1_bars(symbol)
                .await
                .map_err(map_ctrader_err),
            // M1 bars ride the chart session.
            Source::Tradingview => Ok(()),
        }
    }

    async fn unsubscribe_m1(&self, symbol: &str, source: Source) -> Result<(), FetchError> {
        match source {
            Source::Ctrader => self
                .ctrader
                .unsubscribe_m1_bars(symbol)
                .await
                .map_err(map_ctrader_err),
            Source::Tradingview => Ok(()),
        }
    }

    async fn reinit(&self, source: ReinitSource) {
        match source {
            ReinitSource::Ctrader => {
                if let Err(e) = self.ctrader.reconnect().await {
                    error!(error = %e, "cTrader reinit failed");
                }
            }
            ReinitSource::Tradingview => {
                if let Err(e) = self.tradingview.reconnect().await {
                    error!(error = %e, "TradingView reinit failed");
                }
            }
            ReinitSource::All => {
                let (ct, tv) =
                    tokio::join!(self.ctrader.reconnect(), self.tradingview.reconnect());
                if let Err(e) = ct {
                    error!(error = %e, "cTrader reinit failed");
                }
                if let Err(e) = tv {
                    error!(error = %e, "TradingView reinit failed");
                }
            }
        }
    }

    fn available_symbols(&self) -> Vec<String> {
        self.ctrader.available_symbols()
    }

    fn is_ctrader_symbol(&self, symbol: &str) -> bool {
        self.ctrader.has_symbol(symbol)
    }
}
