//! Normalized market-data types.
//!
//! Both upstream providers are reduced to this model at the session
//! boundary: ticks, one-minute bars, daily bars, and the one-shot
//! bootstrap package a client receives when it first subscribes.

use serde::{Deserialize, Serialize};

/// Upstream data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Ctrader,
    Tradingview,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ctrader => write!(f, "ctrader"),
            Self::Tradingview => write!(f, "tradingview"),
        }
    }
}

/// Upstream session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// Connected but the tick stream has gone stale.
    Degraded,
    Reconnecting,
    /// Explicitly shut down; no reconnect will follow.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Connected => write!(f, "connected"),
            Self::Degraded => write!(f, "degraded"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Pip metadata for an instrument.
///
/// Provider A reports `digits` and `pip_position` in its symbol catalog.
/// Provider B does not carry pip data at all, so it is estimated from
/// price magnitude (see [`PipInfo::estimate_from_price`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipInfo {
    /// Decimal places for display.
    pub digits: i32,
    /// Pip position: pip size is `10^-pip_position`.
    pub pip_position: i32,
    /// Smallest conventional price increment.
    pub pip_size: f64,
    /// Sub-pip increment (`pip_size / 10`).
    pub pipette_size: f64,
}

impl PipInfo {
    /// Build pip metadata from catalog values.
    pub fn from_catalog(digits: i32, pip_position: i32) -> Self {
        Self {
            digits,
            pip_position,
            pip_size: 10f64.powi(-pip_position),
            pipette_size: 10f64.powi(-(pip_position + 1)),
        }
    }

    /// Estimate pip metadata from price magnitude.
    ///
    /// Approximate by nature; instruments that need exact pip arithmetic
    /// should be sourced from provider A, which carries catalog data.
    pub fn estimate_from_price(price: f64) -> Self {
        let (pip_position, pip_size, pipette_size) = if price > 10_000.0 {
            (0, 1.0, 0.1)
        } else if price > 1_000.0 {
            (1, 0.1, 0.01)
        } else if price > 10.0 {
            (2, 0.01, 0.001)
        } else {
            (4, 0.0001, 0.00001)
        };
        Self {
            digits: pip_position + 1,
            pip_position,
            pip_size,
            pipette_size,
        }
    }
}

/// Per-symbol metadata from provider A's catalog.
///
/// Cached for the session lifetime and invalidated on reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol_id: i64,
    pub symbol_name: String,
    pub digits: i32,
    pub pip_position: i32,
}

impl SymbolInfo {
    pub fn pip(&self) -> PipInfo {
        PipInfo::from_catalog(self.digits, self.pip_position)
    }
}

/// A normalized top-of-book tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub symbol: String,
    pub source: Source,
    pub bid: f64,
    pub ask: f64,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pip: Option<PipInfo>,
}

impl Tick {
    /// Single-price tick (trendbar close, chart update): both sides set
    /// to the same price.
    pub fn from_last_price(
        symbol: String,
        source: Source,
        price: f64,
        timestamp_ms: i64,
        pip: Option<PipInfo>,
    ) -> Self {
        Self {
            symbol,
            source,
            bid: price,
            ask: price,
            timestamp_ms,
            pip,
        }
    }

    /// Tick invariant: both sides finite and positive, `ask >= bid`,
    /// positive timestamp. Single-price ticks carry `bid == ask`;
    /// bid/ask quote events additionally require a strictly uncrossed
    /// book (`ask > bid`) at the session boundary, where violations
    /// are dropped.
    pub fn is_valid(&self) -> bool {
        self.bid.is_finite()
            && self.ask.is_finite()
            && self.bid > 0.0
            && self.ask >= self.bid
            && self.timestamp_ms > 0
    }
}

/// A one-minute OHLC bar.
///
/// `timestamp_ms` is the bar's opening minute boundary in UTC. The OHLC
/// ordering invariant (`low <= open,close <= high`) is trusted from
/// upstream, not enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct M1Bar {
    pub symbol: String,
    pub source: Source,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub timestamp_ms: i64,
}

/// A daily OHLC bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub timestamp_ms: i64,
}

/// One-shot historical bootstrap delivered per (client, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolDataPackage {
    pub symbol: String,
    pub source: Source,
    pub digits: i32,
    /// Average daily range over the lookback window (today excluded).
    pub adr: f64,
    pub todays_open: f64,
    pub todays_high: f64,
    pub todays_low: f64,
    pub projected_adr_high: f64,
    pub projected_adr_low: f64,
    pub initial_price: f64,
    /// M1 bars from the start of the current UTC day.
    pub initial_market_profile: Vec<M1Bar>,
    pub pip_position: i32,
    pub pip_size: f64,
    pub pipette_size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_day_open: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_day_high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_day_low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_day_close: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<f64>,
}
