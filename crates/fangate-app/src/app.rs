//! Application wiring and lifecycle.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use fangate_analytics::{MarketProfileService, TwapService};
use fangate_ctrader::{CtraderConfig, CtraderSession};
use fangate_gateway::{run_server, CoordinatorConfig, Gateway, GatewayConfig, Upstream};
use fangate_tradingview::{TradingViewConfig, TradingViewSession};

use crate::adapter::SessionUpstream;
use crate::config::AppConfig;
use crate::error::AppResult;

/// The assembled application.
pub struct Application {
    config: AppConfig,
}

impl Application {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Wire sessions, analytics, and the gateway; serve until ctrl-c.
    pub async fn run(self) -> AppResult<()> {
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let ctrader = Arc::new(CtraderSession::new(
            CtraderConfig {
                host: self.config.ctrader.host.clone(),
                port: self.config.ctrader.port,
                client_id: self.config.ctrader.client_id.clone(),
                client_secret: self.config.ctrader.client_secret.clone(),
                access_token: self.config.ctrader.access_token.clone(),
                account_id: self.config.ctrader.account_id,
                ..CtraderConfig::default()
            },
            session_tx.clone(),
        ));

        let tradingview = Arc::new(TradingViewSession::new(
            TradingViewConfig {
                auth_token: self
                    .config
                    .tradingview
                    .session_id
                    .clone()
                    .unwrap_or_else(|| "unauthorized_user_token".to_string()),
                ..TradingViewConfig::default()
            },
            session_tx,
        ));

        let (analytics_tx, analytics_rx) = mpsc::unbounded_channel();
        let profile = Arc::new(MarketProfileService::new(analytics_tx.clone()));
        let twap = Arc::new(TwapService::new(analytics_tx));

        let upstream: Arc<dyn Upstream> = Arc::new(SessionUpstream::new(
            Arc::clone(&ctrader),
            Arc::clone(&tradingview),
        ));

        let (gateway, coordinator_rx) = Gateway::new(
            upstream,
            profile,
            twap,
            GatewayConfig {
                queue_capacity: self.config.gateway.queue_capacity,
                coordinator: CoordinatorConfig::default(),
                default_adr_lookback_days: self.config.gateway.default_adr_lookback_days,
            },
        );

        tokio::spawn(Arc::clone(&gateway).run(session_rx, analytics_rx, coordinator_rx));

        // Initial connects run in the background; failures schedule
        // their own backoff, the server starts regardless.
        {
            let ctrader = Arc::clone(&ctrader);
            tokio::spawn(async move {
                if let Err(e) = ctrader.connect().await {
                    error!(error = %e, "Initial cTrader connect failed");
                }
            });
        }
        {
            let tradingview = Arc::clone(&tradingview);
            tokio::spawn(async move {
                if let Err(e) = tradingview.connect().await {
                    error!(error = %e, "Initial TradingView connect failed");
                }
            });
        }

        let port = self.config.server.port;
        tokio::select! {
            result = run_server(gateway, port) => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                ctrader.disconnect().await;
                tradingview.disconnect().await;
            }
        }

        Ok(())
    }
}
