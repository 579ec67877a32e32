//! TradingView session lifecycle and the dual-series state machine.
//!
//! Each subscribed symbol owns two chart sessions: daily (`sds_1`) for
//! ADR and reference prices, one-minute (`sds_2`) for the market
//! profile. Historical bars accumulate per series until the upstream
//! fires `series_completed` for each; only when both have completed is
//! the one-shot bootstrap package emitted. A per-symbol timeout fails
//! the bootstrap (symbol error, no teardown) if completion never comes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use fangate_core::bars::{now_ms, start_of_utc_day_ms};
use fangate_core::{
    bucket_size_for, intraday_ohlc, DailyBar, M1Bar, PipInfo, SessionEvent, SessionState, Source,
    SymbolDataPackage, Tick,
};
use fangate_session::{
    HealthConfig, HealthEvent, HealthMonitor, ReconnectConfig, ReconnectionManager,
};

use crate::error::{TradingViewError, TvResult};
use crate::protocol::{
    command, frame_packet, generate_session_id, is_heartbeat, series_rows, split_packets,
    ChartMessage, SERIES_D1, SERIES_M1,
};

/// TradingView session configuration.
#[derive(Debug, Clone)]
pub struct TradingViewConfig {
    pub url: String,
    pub origin: String,
    /// Auth token; the public unauthorized token unless an account
    /// session id is configured.
    pub auth_token: String,
    pub completion_timeout_ms: u64,
    /// Hard cap on M1 bars accepted per ingestion event.
    pub m1_ingest_cap: usize,
    /// Bars requested for the M1 series (one trading day).
    pub m1_bar_count: u32,
    /// Daily bars requested beyond the ADR lookback.
    pub d1_extra_days: u32,
    pub staleness_ms: i64,
    pub health_check_interval_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for TradingViewConfig {
    fn default() -> Self {
        Self {
            url: "wss://data.tradingview.com/socket.io/websocket".to_string(),
            origin: "https://s.tradingview.com".to_string(),
            auth_token: "unauthorized_user_token".to_string(),
            completion_timeout_ms: 30_000,
            m1_ingest_cap: 1_500,
            m1_bar_count: 1_440,
            d1_extra_days: 5,
            staleness_ms: 60_000,
            health_check_interval_ms: 30_000,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
        }
    }
}

/// Which of a symbol's two chart sessions an upstream id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Series {
    Daily,
    Minute,
}

/// Per-symbol dual-series assembly state.
struct SymbolSub {
    symbol: String,
    lookback_days: usize,
    d1_chart_session: String,
    m1_chart_session: String,
    historical_candles: Vec<DailyBar>,
    m1_candles: Vec<M1Bar>,
    last_candle: Option<DailyBar>,
    d1_complete: bool,
    m1_complete: bool,
    initial_sent: bool,
    timeout_task: Option<JoinHandle<()>>,
}

impl Drop for SymbolSub {
    fn drop(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

struct Conn {
    outbound_tx: mpsc::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: TradingViewConfig,
    state: RwLock<SessionState>,
    should_reconnect: AtomicBool,
    generation: AtomicU64,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    health: HealthMonitor,
    reconnect: ReconnectionManager,
    conn: Mutex<Option<Conn>>,
    subs: Mutex<HashMap<String, SymbolSub>>,
    /// chart-session id -> owning symbol and series kind.
    chart_index: Mutex<HashMap<String, (String, Series)>>,
}

/// TradingView upstream session handle.
pub struct TradingViewSession {
    inner: Arc<Inner>,
}

impl TradingViewSession {
    pub fn new(config: TradingViewConfig, event_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let health = HealthMonitor::new(
            HealthConfig {
                staleness_ms: config.staleness_ms,
                check_interval_ms: config.health_check_interval_ms,
            },
            health_tx,
        );
        let reconnect = ReconnectionManager::new(ReconnectConfig {
            initial_delay: Duration::from_millis(config.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        });

        let inner = Arc::new(Inner {
            config,
            state: RwLock::new(SessionState::Disconnected),
            should_reconnect: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            event_tx,
            health,
            reconnect,
            conn: Mutex::new(None),
            subs: Mutex::new(HashMap::new()),
            chart_index: Mutex::new(HashMap::new()),
        });

        tokio::spawn(forward_health_events(Arc::downgrade(&inner), health_rx));

        Self { inner }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Symbols currently subscribed, sorted.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.subs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn connect(&self) -> TvResult<()> {
        self.inner.should_reconnect.store(true, Ordering::SeqCst);
        Inner::connect(&self.inner).await
    }

    /// Explicit shutdown: cancel reconnect, drop all subscriptions.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.should_reconnect.store(false, Ordering::SeqCst);
        inner.reconnect.cancel_reconnect();
        inner.health.stop();
        inner.teardown_conn();
        inner.subs.lock().clear();
        inner.chart_index.lock().clear();
        inner.set_state(SessionState::Closed);
    }

    /// Manual reinitialization: quiesce fully, then connect again.
    pub async fn reconnect(&self) -> TvResult<()> {
        let inner = &self.inner;
        info!("Manual reconnect requested");
        inner.should_reconnect.store(true, Ordering::SeqCst);
        inner.health.stop();
        inner.reconnect.cancel_reconnect();
        inner.teardown_conn();
        inner.set_state(SessionState::Disconnected);
        Inner::connect(&self.inner).await
    }

    /// Subscribe a symbol: create both chart sessions and start the
    /// historical load. An existing subscription is replaced, which
    /// re-runs the bootstrap and re-emits the package.
    pub async fn subscribe_to_symbol(&self, symbol: &str, lookback_days: usize) -> TvResult<()> {
        let inner = &self.inner;
        if inner.conn.lock().is_none() {
            return Err(TradingViewError::NotConnected);
        }
        inner.remove_symbol(symbol);
        Inner::setup_symbol(&self.inner, symbol, lookback_days).await
    }

    /// Drop a symbol's subscription and delete its chart sessions.
    pub async fn unsubscribe_symbol(&self, symbol: &str) -> TvResult<()> {
        let inner = &self.inner;
        let Some((d1_cs, m1_cs)) = inner.remove_symbol(symbol) else {
            return Ok(());
        };
        if inner.conn.lock().is_some() {
            inner
                .send_raw(command("chart_delete_session", vec![json!(d1_cs)]))
                .await?;
            inner
                .send_raw(command("chart_delete_session", vec![json!(m1_cs)]))
                .await?;
        }
        Ok(())
    }
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        {
            let mut guard = self.state.write();
            if *guard == state {
                return;
            }
            *guard = state;
        }
        let _ = self.event_tx.send(SessionEvent::StateChanged {
            source: Source::Tradingview,
            state,
        });
    }

    async fn connect(self: &Arc<Self>) -> TvResult<()> {
        {
            let mut state = self.state.write();
            if matches!(*state, SessionState::Connecting | SessionState::Connected) {
                return Ok(());
            }
            *state = SessionState::Connecting;
        }
        let _ = self.event_tx.send(SessionEvent::StateChanged {
            source: Source::Tradingview,
            state: SessionState::Connecting,
        });

        self.teardown_conn();
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match self.open_socket(gen).await {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                self.health.start();
                self.reconnect.reset();
                self.resubscribe_all().await;
                info!("TradingView session connected");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "TradingView connect failed");
                // Invalidate the aborted reader/writer callbacks.
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.teardown_conn();
                self.set_state(SessionState::Disconnected);
                self.maybe_schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn open_socket(self: &Arc<Self>, gen: u64) -> TvResult<()> {
        info!(url = %self.config.url, "Connecting to TradingView");

        let mut request = self
            .config
            .url
            .clone()
            .into_client_request()
            .map_err(|e| TradingViewError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().append(
            ORIGIN,
            self.config
                .origin
                .parse()
                .map_err(|_| TradingViewError::ConnectionFailed("bad origin".to_string()))?,
        );

        let (ws_stream, _response) = connect_async(request).await?;
        let (mut sink, mut stream) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(256);

        let writer = {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!(error = %e, "Socket write failed");
                        break;
                    }
                }
                inner.handle_disconnect(gen);
            })
        };

        let reader = {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => inner.handle_text(&text),
                        Some(Ok(Message::Close(_))) => {
                            warn!("TradingView closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "Socket read failed");
                            break;
                        }
                        None => {
                            info!("TradingView stream ended");
                            break;
                        }
                    }
                }
                inner.handle_disconnect(gen);
            })
        };

        *self.conn.lock() = Some(Conn {
            outbound_tx,
            tasks: vec![writer, reader],
        });

        self.send_raw(command(
            "set_auth_token",
            vec![json!(self.config.auth_token)],
        ))
        .await?;
        Ok(())
    }

    async fn send_raw(&self, packet: String) -> TvResult<()> {
        let outbound = self.conn.lock().as_ref().map(|c| c.outbound_tx.clone());
        let Some(outbound) = outbound else {
            return Err(TradingViewError::NotConnected);
        };
        outbound
            .send(packet)
            .await
            .map_err(|_| TradingViewError::NotConnected)
    }

    /// Register the dual-series record and send the chart setup.
    async fn setup_symbol(self: &Arc<Self>, symbol: &str, lookback_days: usize) -> TvResult<()> {
        let d1_cs = generate_session_id("cs");
        let m1_cs = generate_session_id("cs");

        let timeout_task = {
            let weak = Arc::downgrade(self);
            let symbol = symbol.to_string();
            let delay = Duration::from_millis(self.config.completion_timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.check_completion_timeout(&symbol);
                }
            })
        };

        {
            let mut subs = self.subs.lock();
            subs.insert(
                symbol.to_string(),
                SymbolSub {
                    symbol: symbol.to_string(),
                    lookback_days,
                    d1_chart_session: d1_cs.clone(),
                    m1_chart_session: m1_cs.clone(),
                    historical_candles: Vec::new(),
                    m1_candles: Vec::new(),
                    last_candle: None,
                    d1_complete: false,
                    m1_complete: false,
                    initial_sent: false,
                    timeout_task: Some(timeout_task),
                },
            );
            let mut index = self.chart_index.lock();
            index.insert(d1_cs.clone(), (symbol.to_string(), Series::Daily));
            index.insert(m1_cs.clone(), (symbol.to_string(), Series::Minute));
        }

        let resolved = format!("={{\"adjustment\":\"splits\",\"symbol\":\"{symbol}\"}}");
        let d1_count = lookback_days as u32 + self.config.d1_extra_days;

        self.send_raw(command("chart_create_session", vec![json!(d1_cs), json!("")]))
            .await?;
        self.send_raw(command(
            "resolve_symbol",
            vec![json!(d1_cs), json!("sds_sym_1"), json!(resolved)],
        ))
        .await?;
        self.send_raw(command(
            "create_series",
            vec![
                json!(d1_cs),
                json!(SERIES_D1),
                json!("s1"),
                json!("sds_sym_1"),
                json!("1D"),
                json!(d1_count),
                json!(""),
            ],
        ))
        .await?;

        self.send_raw(command("chart_create_session", vec![json!(m1_cs), json!("")]))
            .await?;
        self.send_raw(command(
            "resolve_symbol",
            vec![json!(m1_cs), json!("sds_sym_1"), json!(resolved)],
        ))
        .await?;
        self.send_raw(command(
            "create_series",
            vec![
                json!(m1_cs),
                json!(SERIES_M1),
                json!("s1"),
                json!("sds_sym_1"),
                json!("1"),
                json!(self.config.m1_bar_count),
                json!(""),
            ],
        ))
        .await?;

        debug!(symbol, %d1_cs, %m1_cs, "Chart sessions created");
        Ok(())
    }

    /// Recreate chart sessions for every known symbol after reconnect.
    /// Each bootstrap re-runs and is re-emitted (profile and TWAP state
    /// are replaced downstream, not merged).
    async fn resubscribe_all(self: &Arc<Self>) {
        let pairs: Vec<(String, usize)> = self
            .subs
            .lock()
            .values()
            .map(|s| (s.symbol.clone(), s.lookback_days))
            .collect();
        for (symbol, lookback) in pairs {
            self.remove_symbol(&symbol);
            if let Err(e) = Self::setup_symbol(self, &symbol, lookback).await {
                warn!(symbol = %symbol, error = %e, "Resubscribe failed");
                let _ = self.event_tx.send(SessionEvent::SymbolError {
                    source: Source::Tradingview,
                    symbol,
                    message: format!("resubscribe failed: {e}"),
                });
            }
        }
    }

    /// Remove a symbol's record; returns its chart-session ids.
    fn remove_symbol(&self, symbol: &str) -> Option<(String, String)> {
        let sub = self.subs.lock().remove(symbol)?;
        let mut index = self.chart_index.lock();
        index.remove(&sub.d1_chart_session);
        index.remove(&sub.m1_chart_session);
        Some((sub.d1_chart_session.clone(), sub.m1_chart_session.clone()))
    }

    /// One inbound text frame: zero or more packets.
    fn handle_text(&self, text: &str) {
        for payload in split_packets(text) {
            if is_heartbeat(payload) {
                // Echo the heartbeat verbatim; write-only keepalive.
                let framed = frame_packet(payload);
                if let Some(conn) = self.conn.lock().as_ref() {
                    let _ = conn.outbound_tx.try_send(framed);
                }
                continue;
            }
            let Ok(msg) = serde_json::from_str::<ChartMessage>(payload) else {
                // Server hello and other non-command objects.
                debug!("Non-command packet ignored");
                continue;
            };
            self.handle_message(msg);
        }
    }

    fn handle_message(&self, msg: ChartMessage) {
        match msg.m.as_str() {
            "timescale_update" | "du" => self.handle_series_update(&msg),
            "series_completed" => self.handle_series_completed(&msg),
            "symbol_error" | "critical_error" => {
                let cs = msg.session_param().unwrap_or_default().to_string();
                let owner = self.chart_index.lock().get(&cs).cloned();
                if let Some((symbol, _)) = owner {
                    warn!(symbol = %symbol, method = %msg.m, "Symbol error from upstream");
                    let _ = self.event_tx.send(SessionEvent::SymbolError {
                        source: Source::Tradingview,
                        symbol,
                        message: format!("upstream {}", msg.m),
                    });
                }
            }
            other => debug!(method = other, "Ignoring message"),
        }
    }

    fn handle_series_update(&self, msg: &ChartMessage) {
        let Some(cs) = msg.session_param() else { return };
        let Some((symbol, series)) = self.chart_index.lock().get(cs).cloned() else {
            debug!(%cs, "Update for unknown chart session");
            return;
        };
        let Some(data) = msg.p.get(1) else { return };

        match series {
            Series::Daily => self.ingest_daily(&symbol, data),
            Series::Minute => self.ingest_minute(&symbol, data),
        }
    }

    fn ingest_daily(&self, symbol: &str, data: &Value) {
        let rows = series_rows(data, SERIES_D1);
        if rows.is_empty() {
            return;
        }

        let mut last: Option<DailyBar> = None;
        {
            let mut subs = self.subs.lock();
            let Some(sub) = subs.get_mut(symbol) else { return };
            for row in &rows {
                let Some(bar) = daily_from_row(&row.v) else { continue };
                if !sub.initial_sent {
                    append_or_replace_daily(&mut sub.historical_candles, bar);
                }
                sub.last_candle = Some(bar);
                last = Some(bar);
            }
        }

        if let Some(bar) = last {
            let tick = Tick::from_last_price(
                symbol.to_string(),
                Source::Tradingview,
                bar.close,
                now_ms(),
                Some(PipInfo::estimate_from_price(bar.close)),
            );
            if tick.is_valid() {
                self.health.record_tick();
                let _ = self.event_tx.send(SessionEvent::Tick(tick));
            }
        }
    }

    fn ingest_minute(&self, symbol: &str, data: &Value) {
        let mut rows = series_rows(data, SERIES_M1);
        if rows.is_empty() {
            return;
        }
        if rows.len() > self.config.m1_ingest_cap {
            warn!(
                symbol,
                got = rows.len(),
                cap = self.config.m1_ingest_cap,
                "M1 ingestion over cap, truncating"
            );
            rows.truncate(self.config.m1_ingest_cap);
        }

        let mut latest: Option<M1Bar> = None;
        {
            let mut subs = self.subs.lock();
            let Some(sub) = subs.get_mut(symbol) else { return };
            for row in &rows {
                let Some(bar) = m1_from_row(symbol, &row.v) else { continue };
                if !sub.initial_sent {
                    append_or_replace_m1(&mut sub.m1_candles, bar.clone());
                }
                latest = Some(bar);
            }
        }

        if let Some(bar) = latest {
            let _ = self.event_tx.send(SessionEvent::M1Bar(bar));
        }
    }

    fn handle_series_completed(&self, msg: &ChartMessage) {
        let Some(cs) = msg.session_param() else { return };
        let Some((symbol, series)) = self.chart_index.lock().get(cs).cloned() else {
            return;
        };

        let package = {
            let mut subs = self.subs.lock();
            let Some(sub) = subs.get_mut(&symbol) else { return };

            match series {
                Series::Daily => {
                    if sub.historical_candles.is_empty() {
                        drop(subs);
                        self.fail_symbol(&symbol, "daily series completed with no bars");
                        return;
                    }
                    sub.d1_complete = true;
                }
                Series::Minute => {
                    if sub.m1_candles.is_empty() {
                        drop(subs);
                        self.fail_symbol(&symbol, "minute series completed with no bars");
                        return;
                    }
                    sub.m1_complete = true;
                }
            }

            if sub.d1_complete && sub.m1_complete && !sub.initial_sent {
                sub.initial_sent = true;
                if let Some(task) = sub.timeout_task.take() {
                    task.abort();
                }
                Some(build_package(sub, now_ms()))
            } else {
                None
            }
        };

        if let Some(package) = package {
            info!(symbol = %symbol, "Dual-series bootstrap complete");
            let _ = self.event_tx.send(SessionEvent::Package(Box::new(package)));
        }
    }

    /// Emit a per-symbol error and drop the symbol's record.
    fn fail_symbol(&self, symbol: &str, message: &str) {
        warn!(symbol, message, "Symbol bootstrap failed");
        self.remove_symbol(symbol);
        let _ = self.event_tx.send(SessionEvent::SymbolError {
            source: Source::Tradingview,
            symbol: symbol.to_string(),
            message: message.to_string(),
        });
    }

    /// Completion-timeout check: bootstrap error for the symbol, but no
    /// connection teardown and the record stays for live updates.
    fn check_completion_timeout(&self, symbol: &str) {
        let timed_out = self
            .subs
            .lock()
            .get(symbol)
            .map(|sub| !sub.initial_sent)
            .unwrap_or(false);
        if timed_out {
            warn!(symbol, "Dual-series completion timed out");
            let _ = self.event_tx.send(SessionEvent::SymbolError {
                source: Source::Tradingview,
                symbol: symbol.to_string(),
                message: "initial data load timed out".to_string(),
            });
        }
    }

    fn handle_disconnect(self: &Arc<Self>, gen: u64) {
        if self
            .generation
            .compare_exchange(gen, gen + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.teardown_conn();
        self.health.stop();

        if *self.state.read() == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::Disconnected);
        self.maybe_schedule_reconnect();
    }

    fn maybe_schedule_reconnect(self: &Arc<Self>) {
        if !self.should_reconnect.load(Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Reconnecting);
        let inner = Arc::clone(self);
        self.reconnect
            .schedule_reconnect(move || async move { Inner::connect(&inner).await });
    }

    fn teardown_conn(&self) {
        if let Some(conn) = self.conn.lock().take() {
            for task in conn.tasks {
                task.abort();
            }
        }
    }
}

async fn forward_health_events(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<HealthEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            HealthEvent::Stale => {
                if *inner.state.read() == SessionState::Connected {
                    inner.set_state(SessionState::Degraded);
                }
                let _ = inner.event_tx.send(SessionEvent::Stale {
                    source: Source::Tradingview,
                });
            }
            HealthEvent::TickResumed => {
                if *inner.state.read() == SessionState::Degraded {
                    inner.set_state(SessionState::Connected);
                }
                let _ = inner.event_tx.send(SessionEvent::TickResumed {
                    source: Source::Tradingview,
                });
            }
        }
    }
}

/// Series row values are `[ts_seconds, open, high, low, close, ...]`.
fn daily_from_row(v: &[f64]) -> Option<DailyBar> {
    if v.len() < 5 {
        return None;
    }
    Some(DailyBar {
        open: v[1],
        high: v[2],
        low: v[3],
        close: v[4],
        timestamp_ms: (v[0] as i64) * 1000,
    })
}

fn m1_from_row(symbol: &str, v: &[f64]) -> Option<M1Bar> {
    if v.len() < 5 {
        return None;
    }
    Some(M1Bar {
        symbol: symbol.to_string(),
        source: Source::Tradingview,
        open: v[1],
        high: v[2],
        low: v[3],
        close: v[4],
        timestamp_ms: (v[0] as i64) * 1000,
    })
}

/// `du` updates repeat the forming bar; replace on equal timestamp.
fn append_or_replace_daily(bars: &mut Vec<DailyBar>, bar: DailyBar) {
    match bars.last_mut() {
        Some(last) if last.timestamp_ms == bar.timestamp_ms => *last = bar,
        _ => bars.push(bar),
    }
}

fn append_or_replace_m1(bars: &mut Vec<M1Bar>, bar: M1Bar) {
    match bars.last_mut() {
        Some(last) if last.timestamp_ms == bar.timestamp_ms => *last = bar,
        _ => bars.push(bar),
    }
}

/// ADR over the historical dailies, excluding the most recent (today's
/// partial). Unlike provider A's partial-window fallback, fewer than
/// `lookback` completed bars yields 0.
fn strict_adr(bars: &[DailyBar], lookback: usize) -> f64 {
    if bars.len() < 2 || lookback == 0 {
        return 0.0;
    }
    let completed = &bars[..bars.len() - 1];
    if completed.len() < lookback {
        return 0.0;
    }
    let window = &completed[completed.len() - lookback..];
    window.iter().map(|b| b.high - b.low).sum::<f64>() / lookback as f64
}

fn build_package(sub: &SymbolSub, now: i64) -> SymbolDataPackage {
    let adr = strict_adr(&sub.historical_candles, sub.lookback_days);
    let last_candle = sub
        .last_candle
        .or_else(|| sub.historical_candles.last().copied())
        .unwrap_or(DailyBar {
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            timestamp_ms: now,
        });

    let day_start = start_of_utc_day_ms(now);
    let todays_m1: Vec<M1Bar> = sub
        .m1_candles
        .iter()
        .filter(|b| b.timestamp_ms >= day_start)
        .cloned()
        .collect();

    let (todays_open, todays_high, todays_low) = match intraday_ohlc(&todays_m1) {
        Some(ohlc) => (ohlc.open, ohlc.high, ohlc.low),
        None => (last_candle.close, last_candle.high, last_candle.low),
    };
    let initial_price = todays_m1
        .last()
        .map(|b| b.close)
        .unwrap_or(last_candle.close);
    let pip = PipInfo::estimate_from_price(initial_price);

    let n = sub.historical_candles.len();
    let prev_day = if n >= 2 {
        Some(sub.historical_candles[n - 2])
    } else {
        None
    };

    SymbolDataPackage {
        symbol: sub.symbol.clone(),
        source: Source::Tradingview,
        digits: pip.digits,
        adr,
        todays_open,
        todays_high,
        todays_low,
        projected_adr_high: todays_open + adr / 2.0,
        projected_adr_low: todays_open - adr / 2.0,
        initial_price,
        initial_market_profile: todays_m1,
        pip_position: pip.pip_position,
        pip_size: pip.pip_size,
        pipette_size: pip.pipette_size,
        prev_day_open: prev_day.map(|b| b.open),
        prev_day_high: prev_day.map(|b| b.high),
        prev_day_low: prev_day.map(|b| b.low),
        prev_day_close: prev_day.map(|b| b.close),
        bucket_size: Some(bucket_size_for(&sub.symbol)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fangate_core::bars::now_ms;

    /// Register a symbol record without touching the network.
    fn register(session: &TradingViewSession, symbol: &str, lookback: usize) -> (String, String) {
        let d1_cs = format!("cs_d1_{symbol}");
        let m1_cs = format!("cs_m1_{symbol}");
        session.inner.subs.lock().insert(
            symbol.to_string(),
            SymbolSub {
                symbol: symbol.to_string(),
                lookback_days: lookback,
                d1_chart_session: d1_cs.clone(),
                m1_chart_session: m1_cs.clone(),
                historical_candles: Vec::new(),
                m1_candles: Vec::new(),
                last_candle: None,
                d1_complete: false,
                m1_complete: false,
                initial_sent: false,
                timeout_task: None,
            },
        );
        let mut index = session.inner.chart_index.lock();
        index.insert(d1_cs.clone(), (symbol.to_string(), Series::Daily));
        index.insert(m1_cs.clone(), (symbol.to_string(), Series::Minute));
        (d1_cs, m1_cs)
    }

    fn session() -> (TradingViewSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TradingViewSession::new(TradingViewConfig::default(), tx), rx)
    }

    fn d1_update(cs: &str, rows: &[(f64, f64, f64, f64, f64)]) -> String {
        let rows: Vec<Value> = rows
            .iter()
            .map(|(ts, o, h, l, c)| json!({"i": 0, "v": [ts, o, h, l, c, 0.0]}))
            .collect();
        json!({"m": "timescale_update", "p": [cs, { SERIES_D1: {"s": rows} }]}).to_string()
    }

    fn m1_update(cs: &str, rows: &[(f64, f64, f64, f64, f64)]) -> String {
        let rows: Vec<Value> = rows
            .iter()
            .map(|(ts, o, h, l, c)| json!({"i": 0, "v": [ts, o, h, l, c, 0.0]}))
            .collect();
        json!({"m": "du", "p": [cs, { SERIES_M1: {"s": rows} }]}).to_string()
    }

    fn completed(cs: &str, series: &str) -> String {
        json!({"m": "series_completed", "p": [cs, series, "streaming"]}).to_string()
    }

    fn frame(payload: &str) -> String {
        frame_packet(payload)
    }

    fn today_secs() -> f64 {
        (now_ms() / 1000) as f64
    }

    #[tokio::test]
    async fn test_package_emitted_only_after_both_series_complete() {
        let (session, mut rx) = session();
        let (d1_cs, m1_cs) = register(&session, "EURUSD", 2);
        let inner = &session.inner;
        let t = today_secs();

        // Three daily bars (last is today's partial).
        inner.handle_text(&frame(&d1_update(
            &d1_cs,
            &[
                (t - 172_800.0, 1.08, 1.09, 1.07, 1.085),
                (t - 86_400.0, 1.085, 1.095, 1.075, 1.09),
                (t, 1.09, 1.10, 1.08, 1.088),
            ],
        )));
        // Daily updates emit a tick from the latest close.
        match rx.try_recv().unwrap() {
            SessionEvent::Tick(tick) => {
                assert_eq!(tick.bid, 1.088);
                assert_eq!(tick.source, Source::Tradingview);
            }
            other => panic!("expected tick, got {other:?}"),
        }

        // First completion: no package yet.
        inner.handle_text(&frame(&completed(&d1_cs, SERIES_D1)));
        assert!(rx.try_recv().is_err());

        // Minute bars for today.
        inner.handle_text(&frame(&m1_update(
            &m1_cs,
            &[(t - 60.0, 1.088, 1.090, 1.087, 1.089), (t, 1.089, 1.092, 1.088, 1.091)],
        )));
        match rx.try_recv().unwrap() {
            SessionEvent::M1Bar(bar) => assert_eq!(bar.close, 1.091),
            other => panic!("expected m1 bar, got {other:?}"),
        }

        // Second completion: package now, exactly once.
        inner.handle_text(&frame(&completed(&m1_cs, SERIES_M1)));
        match rx.try_recv().unwrap() {
            SessionEvent::Package(pkg) => {
                assert_eq!(pkg.symbol, "EURUSD");
                assert_eq!(pkg.source, Source::Tradingview);
                assert_eq!(pkg.todays_open, 1.088);
                assert_eq!(pkg.initial_price, 1.091);
                assert_eq!(pkg.initial_market_profile.len(), 2);
                let spread = pkg.projected_adr_high - pkg.projected_adr_low;
                assert!((spread - pkg.adr).abs() < 1e-12);
                // ADR over 2 completed dailies with lookback 2.
                assert!((pkg.adr - 0.02).abs() < 1e-12);
                assert_eq!(pkg.prev_day_close, Some(1.09));
            }
            other => panic!("expected package, got {other:?}"),
        }

        // A repeated completion does not re-emit.
        inner.handle_text(&frame(&completed(&m1_cs, SERIES_M1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_series_completion_fails_symbol() {
        let (session, mut rx) = session();
        let (d1_cs, _) = register(&session, "EURUSD", 2);

        session.inner.handle_text(&frame(&completed(&d1_cs, SERIES_D1)));
        match rx.try_recv().unwrap() {
            SessionEvent::SymbolError { symbol, .. } => assert_eq!(symbol, "EURUSD"),
            other => panic!("expected symbol error, got {other:?}"),
        }
        assert!(session.inner.subs.lock().get("EURUSD").is_none());
    }

    #[tokio::test]
    async fn test_completion_timeout_emits_error_without_teardown() {
        let (session, mut rx) = session();
        register(&session, "EURUSD", 2);

        session.inner.check_completion_timeout("EURUSD");
        match rx.try_recv().unwrap() {
            SessionEvent::SymbolError { symbol, message, .. } => {
                assert_eq!(symbol, "EURUSD");
                assert!(message.contains("timed out"));
            }
            other => panic!("expected symbol error, got {other:?}"),
        }
        // Record stays; live updates may still flow.
        assert!(session.inner.subs.lock().get("EURUSD").is_some());
    }

    #[tokio::test]
    async fn test_timeout_after_package_is_silent() {
        let (session, mut rx) = session();
        let (d1_cs, m1_cs) = register(&session, "EURUSD", 2);
        let inner = &session.inner;
        let t = today_secs();

        inner.handle_text(&frame(&d1_update(
            &d1_cs,
            &[(t - 86_400.0, 1.0, 1.1, 0.9, 1.05), (t, 1.05, 1.06, 1.04, 1.055)],
        )));
        inner.handle_text(&frame(&m1_update(&m1_cs, &[(t, 1.05, 1.06, 1.04, 1.055)])));
        inner.handle_text(&frame(&completed(&d1_cs, SERIES_D1)));
        inner.handle_text(&frame(&completed(&m1_cs, SERIES_M1)));

        // Drain tick/bar/package events.
        while rx.try_recv().is_ok() {}

        inner.check_completion_timeout("EURUSD");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_m1_ingest_cap_truncates() {
        let (session, _rx) = session();
        let (_, m1_cs) = register(&session, "EURUSD", 2);

        let cap = session.inner.config.m1_ingest_cap;
        let t = today_secs();
        let rows: Vec<(f64, f64, f64, f64, f64)> = (0..cap + 100)
            .map(|i| (t + (i as f64) * 60.0, 1.0, 1.1, 0.9, 1.05))
            .collect();
        session
            .inner
            .handle_text(&frame(&m1_update(&m1_cs, &rows)));

        let subs = session.inner.subs.lock();
        assert_eq!(subs.get("EURUSD").unwrap().m1_candles.len(), cap);
    }

    #[tokio::test]
    async fn test_du_replaces_forming_bar() {
        let (session, mut rx) = session();
        let (d1_cs, _) = register(&session, "EURUSD", 2);
        let t = today_secs();

        session
            .inner
            .handle_text(&frame(&d1_update(&d1_cs, &[(t, 1.08, 1.09, 1.07, 1.085)])));
        session
            .inner
            .handle_text(&frame(&d1_update(&d1_cs, &[(t, 1.08, 1.095, 1.07, 1.09)])));

        let subs = session.inner.subs.lock();
        let sub = subs.get("EURUSD").unwrap();
        assert_eq!(sub.historical_candles.len(), 1);
        assert_eq!(sub.historical_candles[0].close, 1.09);
        drop(subs);
        // Both updates emitted ticks.
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Tick(_)));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Tick(_)));
    }

    #[test]
    fn test_strict_adr_requires_full_window() {
        let bar = |h: f64, l: f64| DailyBar {
            open: l,
            high: h,
            low: l,
            close: h,
            timestamp_ms: 1,
        };
        // Two completed + today's partial, lookback 2.
        let bars = vec![bar(1.02, 1.00), bar(1.04, 1.00), bar(1.50, 1.00)];
        assert!((strict_adr(&bars, 2) - 0.03).abs() < 1e-12);
        // Only one completed bar with lookback 2: 0.
        assert_eq!(strict_adr(&bars[1..], 2), 0.0);
        assert_eq!(strict_adr(&[], 2), 0.0);
    }
}
