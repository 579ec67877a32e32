//! Core domain types for the fangate market-data gateway.
//!
//! Contains the normalized market-data model shared by both upstream
//! sessions (ticks, bars, bootstrap packages), the session event sum
//! type, and pure helpers for ADR and UTC day arithmetic.

pub mod bars;
pub mod bucket;
pub mod error;
pub mod event;
pub mod types;

pub use bars::{average_daily_range, intraday_ohlc, start_of_utc_day_ms, IntradayOhlc};
pub use bucket::bucket_size_for;
pub use error::{CoreError, Result};
pub use event::SessionEvent;
pub use types::{
    DailyBar, M1Bar, PipInfo, SessionState, Source, SymbolDataPackage, SymbolInfo, Tick,
};

/// Default ADR lookback window in daily bars.
pub const DEFAULT_ADR_LOOKBACK_DAYS: usize = 14;
