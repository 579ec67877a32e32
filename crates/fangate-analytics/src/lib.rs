//! Derived per-symbol analytics.
//!
//! Both services bootstrap from a package's bar sequence, then update
//! incrementally from live M1 bars with deduplication by bar
//! timestamp. State lives until process exit and is replaced, not
//! merged, when a new bootstrap arrives for the same symbol.

pub mod profile;
pub mod twap;

pub use profile::{MarketProfileService, ProfileLevel, MAX_LEVELS};
pub use twap::TwapService;

use fangate_core::Source;

/// Events emitted by the analytics services.
#[derive(Debug, Clone)]
pub enum AnalyticsEvent {
    ProfileUpdate {
        symbol: String,
        levels: Vec<ProfileLevel>,
        bucket_size: f64,
        seq: u64,
        source: Source,
    },
    ProfileError {
        symbol: String,
        code: String,
        message: String,
    },
    TwapUpdate {
        symbol: String,
        source: Source,
        twap_value: f64,
        timestamp_ms: i64,
        contributions: u64,
        is_historical: bool,
    },
    TwapError {
        symbol: String,
        code: String,
        message: String,
    },
}
