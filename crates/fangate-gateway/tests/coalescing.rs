//! End-to-end gateway flow: identical concurrent bootstrap requests
//! share one upstream fetch, and every requester receives the package
//! before any live tick.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use fangate_analytics::{MarketProfileService, TwapService};
use fangate_core::{M1Bar, PipInfo, SessionEvent, Source, SymbolDataPackage, Tick};
use fangate_gateway::{FetchError, Gateway, GatewayConfig, ReinitSource, Upstream};

/// Counting stub upstream: every fetch succeeds after one yield.
struct StubUpstream {
    fetches: AtomicU32,
    quote_subs: AtomicU32,
}

impl StubUpstream {
    fn new() -> Self {
        Self {
            fetches: AtomicU32::new(0),
            quote_subs: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Upstream for StubUpstream {
    async fn fetch_package(
        &self,
        symbol: &str,
        _adr_lookback_days: usize,
    ) -> Result<SymbolDataPackage, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(SymbolDataPackage {
            symbol: symbol.to_string(),
            source: Source::Ctrader,
            digits: 5,
            adr: 0.01,
            todays_open: 1.08,
            todays_high: 1.09,
            todays_low: 1.07,
            projected_adr_high: 1.085,
            projected_adr_low: 1.075,
            initial_price: 1.082,
            initial_market_profile: vec![M1Bar {
                symbol: symbol.to_string(),
                source: Source::Ctrader,
                open: 1.08,
                high: 1.081,
                low: 1.079,
                close: 1.0805,
                timestamp_ms: 60_000,
            }],
            pip_position: 4,
            pip_size: 0.0001,
            pipette_size: 0.00001,
            prev_day_open: None,
            prev_day_high: None,
            prev_day_low: None,
            prev_day_close: None,
            bucket_size: Some(0.0001),
        })
    }

    async fn subscribe_chart(&self, _symbol: &str, _lookback_days: usize) -> Result<(), FetchError> {
        Ok(())
    }

    async fn subscribe_quotes(&self, _symbol: &str, _source: Source) -> Result<(), FetchError> {
        self.quote_subs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe_quotes(&self, _symbol: &str, _source: Source) -> Result<(), FetchError> {
        Ok(())
    }

    async fn subscribe_m1(&self, _symbol: &str, _source: Source) -> Result<(), FetchError> {
        Ok(())
    }

    async fn unsubscribe_m1(&self, _symbol: &str, _source: Source) -> Result<(), FetchError> {
        Ok(())
    }

    async fn reinit(&self, _source: ReinitSource) {}

    fn available_symbols(&self) -> Vec<String> {
        vec!["EURUSD".to_string()]
    }

    fn is_ctrader_symbol(&self, symbol: &str) -> bool {
        symbol == "EURUSD"
    }
}

struct Harness {
    gateway: Arc<Gateway>,
    upstream: Arc<StubUpstream>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
}

fn harness() -> Harness {
    let upstream = Arc::new(StubUpstream::new());
    let (analytics_tx, analytics_rx) = mpsc::unbounded_channel();
    let profile = Arc::new(MarketProfileService::new(analytics_tx.clone()));
    let twap = Arc::new(TwapService::new(analytics_tx));

    let (gateway, coord_rx) = Gateway::new(
        Arc::clone(&upstream) as Arc<dyn Upstream>,
        profile,
        twap,
        GatewayConfig::default(),
    );

    let (session_tx, session_rx) = mpsc::unbounded_channel();
    tokio::spawn(Arc::clone(&gateway).run(session_rx, analytics_rx, coord_rx));

    Harness {
        gateway,
        upstream,
        session_tx,
    }
}

async fn connect(h: &Harness) -> (Uuid, mpsc::Receiver<String>) {
    let client = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(64);
    h.gateway.on_client_connect(client, tx);
    // Drain the greeting status message.
    let _ = rx.recv().await.unwrap();
    (client, rx)
}

async fn next_json(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
    let text = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed");
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_identical_requests_coalesce_to_one_fetch() {
    let h = harness();
    let (a, mut rx_a) = connect(&h).await;
    let (b, mut rx_b) = connect(&h).await;

    let req = r#"{"type":"get_symbol_data_package","symbol":"EURUSD","adrLookbackDays":14}"#;
    h.gateway.handle_client_message(a, req);
    h.gateway.handle_client_message(b, req);

    let pkg_a = next_json(&mut rx_a).await;
    let pkg_b = next_json(&mut rx_b).await;

    assert_eq!(pkg_a["type"], "symbolDataPackage");
    assert_eq!(pkg_a, pkg_b);
    assert_eq!(h.upstream.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_package_precedes_ticks_for_new_subscriber() {
    let h = harness();
    let (a, mut rx_a) = connect(&h).await;

    // A tick before the client subscribes is not delivered.
    let tick = Tick {
        symbol: "EURUSD".to_string(),
        source: Source::Ctrader,
        bid: 1.085,
        ask: 1.0851,
        timestamp_ms: 1,
        pip: Some(PipInfo::from_catalog(5, 4)),
    };
    h.session_tx.send(SessionEvent::Tick(tick.clone())).unwrap();

    h.gateway.handle_client_message(
        a,
        r#"{"type":"get_symbol_data_package","symbol":"EURUSD","adrLookbackDays":14}"#,
    );

    let first = next_json(&mut rx_a).await;
    assert_eq!(first["type"], "symbolDataPackage");
    assert!((first["projectedAdrHigh"].as_f64().unwrap()
        - first["projectedAdrLow"].as_f64().unwrap()
        - first["adr"].as_f64().unwrap())
    .abs()
        < 1e-9);

    // Live ticks flow after the package; analytics bootstrap messages
    // may be interleaved.
    h.session_tx.send(SessionEvent::Tick(tick)).unwrap();
    let mut value = next_json(&mut rx_a).await;
    while value["type"] != "tick" {
        value = next_json(&mut rx_a).await;
    }
    assert_eq!(value["symbol"], "EURUSD");
    assert_eq!(value["bid"], 1.085);
}

#[tokio::test]
async fn test_m1_bars_drive_profile_and_twap_updates() {
    let h = harness();
    let (a, mut rx_a) = connect(&h).await;

    h.gateway.handle_client_message(
        a,
        r#"{"type":"get_symbol_data_package","symbol":"EURUSD"}"#,
    );
    let first = next_json(&mut rx_a).await;
    assert_eq!(first["type"], "symbolDataPackage");

    // A fresh M1 bar produces one profile update and one TWAP update.
    h.session_tx
        .send(SessionEvent::M1Bar(M1Bar {
            symbol: "EURUSD".to_string(),
            source: Source::Ctrader,
            open: 1.0805,
            high: 1.0808,
            low: 1.0804,
            close: 1.0807,
            timestamp_ms: 120_000,
        }))
        .unwrap();

    // Expect a profile update and a live TWAP update; a historical
    // TWAP update from the bootstrap may precede them.
    let mut saw_profile = false;
    let mut saw_live_twap = false;
    for _ in 0..4 {
        let value = next_json(&mut rx_a).await;
        match value["type"].as_str().unwrap() {
            "profileUpdate" => {
                assert_eq!(value["seq"], 1);
                saw_profile = true;
            }
            "twapUpdate" if value["isHistorical"] == false => {
                assert_eq!(value["contributions"], 2);
                saw_live_twap = true;
            }
            _ => {}
        }
        if saw_profile && saw_live_twap {
            break;
        }
    }
    assert!(saw_profile);
    assert!(saw_live_twap);
}
