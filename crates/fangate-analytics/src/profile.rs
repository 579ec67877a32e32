//! Market profile: time-price-opportunity counts per price bucket.
//!
//! Each M1 bar contributes +1 to every bucket its range touches.
//! Bucket prices are keyed as `round(price * 1e5)` so map keys are
//! exact integers; prices are recovered on emission, which also gives
//! ascending order for free from the BTreeMap.
//!
//! The service keys state by symbol only. A symbol fed from both
//! sources would clobber one profile with the other; inherited
//! behavior, kept as-is.

use std::collections::BTreeMap;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use fangate_core::bars::now_ms;
use fangate_core::{bucket_size_for, M1Bar, Source};

use crate::AnalyticsEvent;

/// Soft cap on distinct price levels per symbol. Crossing it emits a
/// profile error and freezes further updates for that symbol.
pub const MAX_LEVELS: usize = 3000;

/// Per-bar cap on buckets applied in one ingestion.
pub const MAX_BUCKETS_PER_BAR: usize = 5000;

/// Price key scale: five decimal places.
const KEY_SCALE: f64 = 100_000.0;

/// A profile histogram level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileLevel {
    pub price: f64,
    pub tpo: u32,
}

#[derive(Debug)]
struct ProfileState {
    levels: BTreeMap<i64, u32>,
    bucket_size: f64,
    source: Source,
    seq: u64,
    last_update_ms: i64,
    last_bar_timestamp_ms: Option<i64>,
    /// Set once the level cap was hit; updates stop silently after.
    capped: bool,
}

/// Per-symbol TPO histogram service.
pub struct MarketProfileService {
    states: DashMap<String, ProfileState>,
    event_tx: mpsc::UnboundedSender<AnalyticsEvent>,
}

impl MarketProfileService {
    pub fn new(event_tx: mpsc::UnboundedSender<AnalyticsEvent>) -> Self {
        Self {
            states: DashMap::new(),
            event_tx,
        }
    }

    /// Ensure state exists for a symbol with its class bucket size.
    pub fn subscribe_to_symbol(&self, symbol: &str, source: Source) {
        self.states
            .entry(symbol.to_string())
            .and_modify(|state| state.source = source)
            .or_insert_with(|| ProfileState {
                levels: BTreeMap::new(),
                bucket_size: bucket_size_for(symbol),
                source,
                seq: 0,
                last_update_ms: now_ms(),
                last_bar_timestamp_ms: None,
                capped: false,
            });
    }

    /// Replace any existing histogram with one built from history.
    pub fn initialize_from_history(
        &self,
        symbol: &str,
        bars: &[M1Bar],
        bucket_size: f64,
        source: Source,
    ) {
        let mut levels = BTreeMap::new();
        for bar in bars {
            if !bar.low.is_finite() || !bar.high.is_finite() {
                debug!(symbol, "Skipping non-finite history bar");
                continue;
            }
            apply_bar(&mut levels, bar, bucket_size);
        }
        let state = ProfileState {
            levels,
            bucket_size,
            source,
            seq: 0,
            last_update_ms: now_ms(),
            last_bar_timestamp_ms: bars.last().map(|b| b.timestamp_ms),
            capped: false,
        };
        self.states.insert(symbol.to_string(), state);
        debug!(symbol, bars = bars.len(), "Profile initialized from history");
    }

    /// Apply one live M1 bar. Idempotent per `(symbol, bar timestamp)`.
    pub fn on_m1_bar(&self, symbol: &str, bar: &M1Bar) {
        let Some(mut state) = self.states.get_mut(symbol) else {
            debug!(symbol, "M1 bar for unknown profile symbol");
            return;
        };

        if !bar.low.is_finite() || !bar.high.is_finite() {
            warn!(symbol, "Non-finite M1 bar dropped");
            return;
        }

        if state.last_bar_timestamp_ms == Some(bar.timestamp_ms) {
            return;
        }
        state.last_bar_timestamp_ms = Some(bar.timestamp_ms);

        if state.capped {
            return;
        }
        if state.levels.len() >= MAX_LEVELS {
            state.capped = true;
            let _ = self.event_tx.send(AnalyticsEvent::ProfileError {
                symbol: symbol.to_string(),
                code: "MAX_LEVELS_EXCEEDED".to_string(),
                message: format!("profile exceeds {MAX_LEVELS} levels"),
            });
            return;
        }

        let bucket_size = state.bucket_size;
        apply_bar(&mut state.levels, bar, bucket_size);
        state.seq += 1;
        state.last_update_ms = now_ms();

        let _ = self.event_tx.send(AnalyticsEvent::ProfileUpdate {
            symbol: symbol.to_string(),
            levels: sorted_levels(&state.levels),
            bucket_size,
            seq: state.seq,
            source: state.source,
        });
    }

    /// Current histogram, ascending by price.
    pub fn levels(&self, symbol: &str) -> Option<Vec<ProfileLevel>> {
        self.states.get(symbol).map(|s| sorted_levels(&s.levels))
    }
}

/// Increment every bucket in `[floor(low/bucket)*bucket, high]`,
/// stepping by the bucket size, capped per bar.
fn apply_bar(levels: &mut BTreeMap<i64, u32>, bar: &M1Bar, bucket_size: f64) {
    let first = (bar.low / bucket_size).floor() as i64;
    // The upper bound is inclusive; tolerate float drift in the
    // accumulated step product.
    let limit = bar.high + bucket_size * 1e-6;
    for step in 0..MAX_BUCKETS_PER_BAR as i64 {
        let price = (first + step) as f64 * bucket_size;
        if price > limit {
            break;
        }
        let key = (price * KEY_SCALE).round() as i64;
        *levels.entry(key).or_insert(0) += 1;
    }
}

fn sorted_levels(levels: &BTreeMap<i64, u32>) -> Vec<ProfileLevel> {
    levels
        .iter()
        .map(|(key, tpo)| ProfileLevel {
            price: *key as f64 / KEY_SCALE,
            tpo: *tpo,
        })
        .collect()
}
