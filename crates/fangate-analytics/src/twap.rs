//! Time-weighted average price: running mean of M1 closes.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use fangate_core::bars::now_ms;
use fangate_core::{M1Bar, Source};

use crate::AnalyticsEvent;

#[derive(Debug)]
struct TwapState {
    sum: f64,
    count: u64,
    twap: f64,
    session_start_ms: i64,
    last_update_ms: i64,
    source: Source,
    /// Last accumulated bar timestamp per source; dedup key is
    /// `(symbol, source, bar timestamp)`.
    last_bar_ts: HashMap<Source, i64>,
}

/// Per-symbol TWAP service.
pub struct TwapService {
    states: DashMap<String, TwapState>,
    event_tx: mpsc::UnboundedSender<AnalyticsEvent>,
}

impl TwapService {
    pub fn new(event_tx: mpsc::UnboundedSender<AnalyticsEvent>) -> Self {
        Self {
            states: DashMap::new(),
            event_tx,
        }
    }

    /// Seed (or replace) a symbol's TWAP from a bootstrap bar sequence
    /// and emit one historical update.
    pub fn initialize_from_history(&self, symbol: &str, bars: &[M1Bar], source: Source) {
        let now = now_ms();
        let sum: f64 = bars.iter().map(|b| b.close).sum();
        let count = bars.len() as u64;
        let twap = if count > 0 { sum / count as f64 } else { 0.0 };

        let mut last_bar_ts = HashMap::new();
        if let Some(last) = bars.last() {
            last_bar_ts.insert(source, last.timestamp_ms);
        }

        self.states.insert(
            symbol.to_string(),
            TwapState {
                sum,
                count,
                twap,
                session_start_ms: bars.first().map(|b| b.timestamp_ms).unwrap_or(now),
                last_update_ms: now,
                source,
                last_bar_ts,
            },
        );

        let _ = self.event_tx.send(AnalyticsEvent::TwapUpdate {
            symbol: symbol.to_string(),
            source,
            twap_value: twap,
            timestamp_ms: now,
            contributions: count,
            is_historical: true,
        });
        debug!(symbol, contributions = count, "TWAP initialized from history");
    }

    /// Accumulate one live M1 bar.
    pub fn on_m1_bar(&self, symbol: &str, bar: &M1Bar, source: Source) {
        if !bar.close.is_finite() {
            warn!(symbol, "Invalid M1 bar for TWAP");
            let _ = self.event_tx.send(AnalyticsEvent::TwapError {
                symbol: symbol.to_string(),
                code: "INVALID_BAR_DATA".to_string(),
                message: "non-finite close".to_string(),
            });
            return;
        }

        let Some(mut state) = self.states.get_mut(symbol) else {
            debug!(symbol, "M1 bar for unknown TWAP symbol");
            return;
        };

        if state.last_bar_ts.get(&source) == Some(&bar.timestamp_ms) {
            return;
        }
        state.last_bar_ts.insert(source, bar.timestamp_ms);

        state.sum += bar.close;
        state.count += 1;
        state.twap = state.sum / state.count as f64;
        state.last_update_ms = now_ms();

        let _ = self.event_tx.send(AnalyticsEvent::TwapUpdate {
            symbol: symbol.to_string(),
            source,
            twap_value: state.twap,
            timestamp_ms: state.last_update_ms,
            contributions: state.count,
            is_historical: false,
        });
    }

    /// Current TWAP value and contribution count.
    pub fn twap(&self, symbol: &str) -> Option<(f64, u64)> {
        self.states.get(symbol).map(|s| (s.twap, s.count))
    }

    /// Session start timestamp for a symbol, if initialized.
    pub fn session_start_ms(&self, symbol: &str) -> Option<i64> {
        self.states.get(symbol).map(|s| s.session_start_ms)
    }

    /// Source recorded at bootstrap.
    pub fn source(&self, symbol: &str) -> Option<Source> {
        self.states.get(symbol).map(|s| s.source)
    }
}
