//! Bar arithmetic: ADR, intraday OHLC, UTC day boundaries.

use crate::types::{DailyBar, M1Bar};
use chrono::{DateTime, Utc};

/// Average daily range: mean of `high - low` over the last `lookback`
/// daily bars, excluding the most recent bar (today's partial).
///
/// Returns 0.0 when fewer than two bars are available. Never negative,
/// never NaN.
pub fn average_daily_range(bars: &[DailyBar], lookback: usize) -> f64 {
    if bars.len() < 2 || lookback == 0 {
        return 0.0;
    }
    let completed = &bars[..bars.len() - 1];
    let start = completed.len().saturating_sub(lookback);
    let window = &completed[start..];
    if window.is_empty() {
        return 0.0;
    }
    let sum: f64 = window.iter().map(|b| b.high - b.low).sum();
    sum / window.len() as f64
}

/// Millisecond timestamp of the start of the UTC day containing `now_ms`.
pub fn start_of_utc_day_ms(now_ms: i64) -> i64 {
    const DAY_MS: i64 = 86_400_000;
    now_ms.div_euclid(DAY_MS) * DAY_MS
}

/// Current UTC time in epoch milliseconds.
pub fn now_ms() -> i64 {
    let now: DateTime<Utc> = Utc::now();
    now.timestamp_millis()
}

/// Open/high/low aggregated from a bar sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntradayOhlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
}

/// Aggregate today's open/high/low from intraday M1 bars.
///
/// Open is the first bar's open; high/low span all bars. Returns None
/// for an empty slice (caller falls back to the last daily bar).
pub fn intraday_ohlc(bars: &[M1Bar]) -> Option<IntradayOhlc> {
    let first = bars.first()?;
    let mut ohlc = IntradayOhlc {
        open: first.open,
        high: first.high,
        low: first.low,
    };
    for bar in &bars[1..] {
        if bar.high > ohlc.high {
            ohlc.high = bar.high;
        }
        if bar.low < ohlc.low {
            ohlc.low = bar.low;
        }
    }
    Some(ohlc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Source;

    fn daily(high: f64, low: f64) -> DailyBar {
        DailyBar {
            open: low,
            high,
            low,
            close: high,
            timestamp_ms: 1,
        }
    }

    fn m1(open: f64, high: f64, low: f64) -> M1Bar {
        M1Bar {
            symbol: "EURUSD".to_string(),
            source: Source::Ctrader,
            open,
            high,
            low,
            close: open,
            timestamp_ms: 1,
        }
    }

    #[test]
    fn test_adr_excludes_most_recent_bar() {
        // 15 completed bars of range 0.01, then today's partial with range 0.5.
        let mut bars: Vec<DailyBar> = (0..15).map(|_| daily(1.01, 1.00)).collect();
        bars.push(daily(1.50, 1.00));
        let adr = average_daily_range(&bars, 14);
        assert!((adr - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_adr_exactly_lookback_plus_one() {
        let bars: Vec<DailyBar> = (0..15).map(|i| daily(1.0 + (i as f64) * 0.001, 1.0)).collect();
        // 15 bars, lookback 14: mean over bars[0..14] ranges.
        let expected: f64 = (0..14).map(|i| (i as f64) * 0.001).sum::<f64>() / 14.0;
        assert!((average_daily_range(&bars, 14) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_adr_short_history() {
        assert_eq!(average_daily_range(&[], 14), 0.0);
        assert_eq!(average_daily_range(&[daily(1.1, 1.0)], 14), 0.0);
        // Two bars: one completed bar contributes.
        let adr = average_daily_range(&[daily(1.02, 1.00), daily(1.50, 1.00)], 14);
        assert!((adr - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_adr_never_nan() {
        let adr = average_daily_range(&[daily(1.0, 1.0), daily(1.0, 1.0)], 14);
        assert!(adr.is_finite());
        assert!(adr >= 0.0);
    }

    #[test]
    fn test_start_of_utc_day() {
        // 2024-01-02 13:45:00 UTC
        let ts = 1_704_203_100_000;
        let midnight = start_of_utc_day_ms(ts);
        assert_eq!(midnight, 1_704_153_600_000);
        assert_eq!(midnight % 86_400_000, 0);
        assert!(midnight <= ts);
    }

    #[test]
    fn test_intraday_ohlc() {
        let bars = vec![m1(1.10, 1.12, 1.09), m1(1.11, 1.15, 1.10), m1(1.14, 1.14, 1.05)];
        let ohlc = intraday_ohlc(&bars).unwrap();
        assert_eq!(ohlc.open, 1.10);
        assert_eq!(ohlc.high, 1.15);
        assert_eq!(ohlc.low, 1.05);
        assert!(intraday_ohlc(&[]).is_none());
    }
}
