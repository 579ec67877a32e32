//! Prometheus metrics for the gateway.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally: a registration
//! failure means duplicate metric names, a fatal configuration error
//! that should crash at startup. These panics only occur during static
//! initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_int_gauge, register_int_gauge_vec, CounterVec, IntGauge,
    IntGaugeVec, TextEncoder,
};

/// Ticks received per upstream source.
pub static TICKS_RECEIVED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fangate_ticks_received_total",
        "Normalized ticks received from upstream",
        &["source"]
    )
    .unwrap()
});

/// M1 bars received per upstream source.
pub static BARS_RECEIVED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fangate_m1_bars_received_total",
        "Live M1 bars received from upstream",
        &["source"]
    )
    .unwrap()
});

/// Bootstrap packages served to clients.
pub static PACKAGES_SERVED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fangate_packages_served_total",
        "Symbol data packages delivered to clients",
        &["source"]
    )
    .unwrap()
});

/// Connected downstream clients.
pub static CLIENTS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "fangate_clients_connected",
        "Currently connected websocket clients"
    )
    .unwrap()
});

/// Upstream session state (1 = connected).
pub static SESSION_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "fangate_session_connected",
        "Upstream session state (1=connected)",
        &["source"]
    )
    .unwrap()
});

/// Stale-stream transitions per source.
pub static STALE_TRANSITIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fangate_stale_transitions_total",
        "Tick-stream stale transitions",
        &["source"]
    )
    .unwrap()
});

/// Clients disconnected for falling behind the write queue.
pub static SLOW_CLIENTS_DROPPED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fangate_slow_clients_dropped_total",
        "Clients disconnected due to write-queue overflow",
        &["reason"]
    )
    .unwrap()
});

/// Render all registered metrics in Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        TICKS_RECEIVED.with_label_values(&["ctrader"]).inc();
        CLIENTS_CONNECTED.set(2);
        let text = render();
        assert!(text.contains("fangate_ticks_received_total"));
        assert!(text.contains("fangate_clients_connected"));
    }
}
