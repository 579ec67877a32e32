//! Application configuration.
//!
//! Layered: `config/default.toml` (optional) under `FANGATE_`-prefixed
//! environment variables, `__` as the section separator
//! (`FANGATE_CTRADER__HOST`, `FANGATE_SERVER__PORT`, ...).

use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Downstream server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Websocket port; defaults to 8081 in production, 8080 otherwise.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    let is_production = std::env::var("RUST_ENV")
        .map(|v| v == "production")
        .unwrap_or(false);
    if is_production {
        8081
    } else {
        8080
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// cTrader credentials and endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CtraderSettings {
    #[serde(default = "default_ctrader_host")]
    pub host: String,
    #[serde(default = "default_ctrader_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub account_id: i64,
}

fn default_ctrader_host() -> String {
    "live.ctraderapi.com".to_string()
}

fn default_ctrader_port() -> u16 {
    5036
}

impl Default for CtraderSettings {
    fn default() -> Self {
        Self {
            host: default_ctrader_host(),
            port: default_ctrader_port(),
            client_id: String::new(),
            client_secret: String::new(),
            access_token: String::new(),
            account_id: 0,
        }
    }
}

/// TradingView settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TradingViewSettings {
    /// Optional authenticated session token; the public unauthorized
    /// token is used when absent.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Gateway tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_adr_lookback_days")]
    pub default_adr_lookback_days: usize,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_adr_lookback_days() -> usize {
    fangate_core::DEFAULT_ADR_LOOKBACK_DAYS
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            default_adr_lookback_days: default_adr_lookback_days(),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ctrader: CtraderSettings,
    #[serde(default)]
    pub tradingview: TradingViewSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
}

impl AppConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> AppResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        } else {
            builder =
                builder.add_source(::config::File::with_name("config/default").required(false));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("FANGATE").separator("__"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.gateway.queue_capacity == 0 {
            return Err(AppError::InvalidConfig(
                "gateway.queue_capacity must be positive".to_string(),
            ));
        }
        if self.gateway.default_adr_lookback_days == 0 {
            return Err(AppError::InvalidConfig(
                "gateway.default_adr_lookback_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
