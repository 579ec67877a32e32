//! cTrader session lifecycle and data normalization.
//!
//! Connect, authenticate (application then account), load the symbol
//! catalog, then serve spot subscriptions and trendbar history while a
//! write-side heartbeat and a data-side health monitor keep the
//! connection honest. Disconnects reschedule through exponential
//! backoff unless the session was explicitly closed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fangate_codec::FrameCodec;
use fangate_core::bars::{now_ms, start_of_utc_day_ms};
use fangate_core::{
    average_daily_range, bucket_size_for, intraday_ohlc, DailyBar, M1Bar, SessionEvent,
    SessionState, Source, SymbolDataPackage, SymbolInfo, Tick,
};
use fangate_session::{
    HealthConfig, HealthEvent, HealthMonitor, ReconnectConfig, ReconnectionManager,
};

use crate::error::{CtraderError, CtraderResult};
use crate::wire::{
    payload_type as pt, period, scale_price, Envelope, ErrorPayload, SpotEventPayload,
    SymbolByIdPayload, SymbolsListPayload, TrendbarsPayload, WireTrendbar,
};

/// cTrader session configuration.
#[derive(Debug, Clone)]
pub struct CtraderConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
    /// ctidTraderAccountId for account auth and data requests.
    pub account_id: i64,
    pub heartbeat_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub staleness_ms: i64,
    pub health_check_interval_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for CtraderConfig {
    fn default() -> Self {
        Self {
            host: "live.ctraderapi.com".to_string(),
            port: 5036,
            client_id: String::new(),
            client_secret: String::new(),
            access_token: String::new(),
            account_id: 0,
            heartbeat_interval_ms: 10_000,
            request_timeout_ms: 30_000,
            staleness_ms: 60_000,
            health_check_interval_ms: 30_000,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
        }
    }
}

struct Conn {
    outbound_tx: mpsc::Sender<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: CtraderConfig,
    state: RwLock<SessionState>,
    should_reconnect: AtomicBool,
    /// Bumped per connect; lets stale reader/writer tasks detect that
    /// their connection has already been replaced.
    generation: AtomicU64,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    health: HealthMonitor,
    reconnect: ReconnectionManager,
    conn: Mutex<Option<Conn>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    symbols_by_name: RwLock<HashMap<String, i64>>,
    symbols_by_id: RwLock<HashMap<i64, String>>,
    symbol_info: RwLock<HashMap<i64, SymbolInfo>>,
    spot_subs: Mutex<HashSet<i64>>,
    bar_subs: Mutex<HashSet<i64>>,
}

/// cTrader upstream session handle.
pub struct CtraderSession {
    inner: Arc<Inner>,
}

impl CtraderSession {
    pub fn new(config: CtraderConfig, event_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
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
            pending: Mutex::new(HashMap::new()),
            symbols_by_name: RwLock::new(HashMap::new()),
            symbols_by_id: RwLock::new(HashMap::new()),
            symbol_info: RwLock::new(HashMap::new()),
            spot_subs: Mutex::new(HashSet::new()),
            bar_subs: Mutex::new(HashSet::new()),
        });

        tokio::spawn(forward_health_events(
            Arc::downgrade(&inner),
            health_rx,
        ));

        Self { inner }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Symbol names from the loaded catalog, sorted.
    pub fn available_symbols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.symbols_by_name.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether the catalog knows a symbol.
    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.inner.symbols_by_name.read().contains_key(symbol)
    }

    /// Connect, authenticate, and load the symbol catalog.
    pub async fn connect(&self) -> CtraderResult<()> {
        self.inner.should_reconnect.store(true, Ordering::SeqCst);
        Inner::connect(&self.inner).await
    }

    /// Explicit shutdown: no reconnect will follow.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.should_reconnect.store(false, Ordering::SeqCst);
        inner.reconnect.cancel_reconnect();
        inner.health.stop();
        inner.teardown_conn();
        inner.fail_pending();
        inner.spot_subs.lock().clear();
        inner.bar_subs.lock().clear();
        inner.set_state(SessionState::Closed);
    }

    /// Manual reinitialization: quiesce fully, then connect again.
    pub async fn reconnect(&self) -> CtraderResult<()> {
        let inner = &self.inner;
        info!("Manual reconnect requested");
        inner.should_reconnect.store(true, Ordering::SeqCst);
        inner.health.stop();
        inner.reconnect.cancel_reconnect();
        inner.teardown_conn();
        inner.fail_pending();
        inner.set_state(SessionState::Disconnected);
        Inner::connect(&self.inner).await
    }

    /// Subscribe to spot quotes for a symbol. Idempotent per symbol id.
    pub async fn subscribe_spots(&self, symbol: &str) -> CtraderResult<()> {
        let id = self.inner.resolve_symbol(symbol)?;
        if self.inner.spot_subs.lock().contains(&id) {
            return Ok(());
        }
        // Symbol details are needed before quotes can be normalized.
        self.inner.ensure_symbol_info(id).await?;
        self.inner
            .request(
                pt::SUBSCRIBE_SPOTS_REQ,
                json!({
                    "ctidTraderAccountId": self.inner.config.account_id,
                    "symbolId": [id],
                }),
            )
            .await?;
        self.inner.spot_subs.lock().insert(id);
        debug!(symbol, id, "Subscribed to spots");
        Ok(())
    }

    /// Unsubscribe spot quotes. Idempotent.
    pub async fn unsubscribe_spots(&self, symbol: &str) -> CtraderResult<()> {
        let id = self.inner.resolve_symbol(symbol)?;
        if !self.inner.spot_subs.lock().contains(&id) {
            return Ok(());
        }
        self.inner
            .request(
                pt::UNSUBSCRIBE_SPOTS_REQ,
                json!({
                    "ctidTraderAccountId": self.inner.config.account_id,
                    "symbolId": [id],
                }),
            )
            .await?;
        self.inner.spot_subs.lock().remove(&id);
        debug!(symbol, id, "Unsubscribed from spots");
        Ok(())
    }

    /// Subscribe to live M1 trendbars for a symbol (requires an active
    /// spot subscription upstream). Idempotent.
    pub async fn subscribe_m1_bars(&self, symbol: &str) -> CtraderResult<()> {
        let id = self.inner.resolve_symbol(symbol)?;
        if self.inner.bar_subs.lock().contains(&id) {
            return Ok(());
        }
        self.inner
            .request(
                pt::SUBSCRIBE_LIVE_TRENDBAR_REQ,
                json!({
                    "ctidTraderAccountId": self.inner.config.account_id,
                    "symbolId": id,
                    "period": period::M1,
                }),
            )
            .await?;
        self.inner.bar_subs.lock().insert(id);
        Ok(())
    }

    /// Unsubscribe live M1 trendbars. Idempotent.
    pub async fn unsubscribe_m1_bars(&self, symbol: &str) -> CtraderResult<()> {
        let id = self.inner.resolve_symbol(symbol)?;
        if !self.inner.bar_subs.lock().contains(&id) {
            return Ok(());
        }
        self.inner
            .request(
                pt::UNSUBSCRIBE_LIVE_TRENDBAR_REQ,
                json!({
                    "ctidTraderAccountId": self.inner.config.account_id,
                    "symbolId": id,
                    "period": period::M1,
                }),
            )
            .await?;
        self.inner.bar_subs.lock().remove(&id);
        Ok(())
    }

    /// Fetch the one-shot bootstrap package for a symbol: daily history
    /// for ADR plus today's M1 bars, requested concurrently.
    pub async fn get_symbol_data_package(
        &self,
        symbol: &str,
        adr_lookback_days: usize,
    ) -> CtraderResult<SymbolDataPackage> {
        let inner = &self.inner;
        let id = inner.resolve_symbol(symbol)?;
        let info = inner.ensure_symbol_info(id).await?;

        let now = now_ms();
        let d1_from = now - ((adr_lookback_days as i64) + 5) * 86_400_000;
        let m1_from = start_of_utc_day_ms(now);

        let d1_req = inner.request(
            pt::GET_TRENDBARS_REQ,
            json!({
                "ctidTraderAccountId": inner.config.account_id,
                "symbolId": id,
                "period": period::D1,
                "fromTimestamp": d1_from,
                "toTimestamp": now,
            }),
        );
        let m1_req = inner.request(
            pt::GET_TRENDBARS_REQ,
            json!({
                "ctidTraderAccountId": inner.config.account_id,
                "symbolId": id,
                "period": period::M1,
                "fromTimestamp": m1_from,
                "toTimestamp": now,
            }),
        );
        let (d1_res, m1_res) = tokio::try_join!(d1_req, m1_req)?;

        let d1: TrendbarsPayload = serde_json::from_value(d1_res.payload)?;
        let m1: TrendbarsPayload = serde_json::from_value(m1_res.payload)?;

        let mut daily: Vec<DailyBar> = d1
            .trendbar
            .iter()
            .map(|bar| daily_from_wire(bar, info.digits))
            .collect();
        daily.sort_by_key(|b| b.timestamp_ms);

        let mut m1_bars: Vec<M1Bar> = m1
            .trendbar
            .iter()
            .map(|bar| m1_from_wire(symbol, bar, info.digits))
            .collect();
        m1_bars.sort_by_key(|b| b.timestamp_ms);

        build_package(symbol, &info, daily, m1_bars, adr_lookback_days)
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
            source: Source::Ctrader,
            state,
        });
    }

    fn resolve_symbol(&self, symbol: &str) -> CtraderResult<i64> {
        self.symbols_by_name
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| CtraderError::UnknownSymbol(symbol.to_string()))
    }

    async fn connect(self: &Arc<Self>) -> CtraderResult<()> {
        {
            let mut state = self.state.write();
            if matches!(
                *state,
                SessionState::Connecting | SessionState::Authenticating | SessionState::Connected
            ) {
                return Ok(());
            }
            *state = SessionState::Connecting;
        }
        let _ = self.event_tx.send(SessionEvent::StateChanged {
            source: Source::Ctrader,
            state: SessionState::Connecting,
        });

        self.teardown_conn();
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match self.open_and_authenticate(gen).await {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                self.health.start();
                self.reconnect.reset();
                self.restore_subscriptions().await;
                info!("cTrader session connected");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "cTrader connect failed");
                // Invalidate the aborted reader/writer callbacks.
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.teardown_conn();
                self.fail_pending();
                self.set_state(SessionState::Disconnected);
                self.maybe_schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn open_and_authenticate(self: &Arc<Self>, gen: u64) -> CtraderResult<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(%addr, "Connecting to cTrader");

        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| CtraderError::ConnectionFailed(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
        let tls = connector
            .connect(&self.config.host, tcp)
            .await
            .map_err(|e| CtraderError::ConnectionFailed(e.to_string()))?;

        let framed = Framed::new(tls, FrameCodec);
        let (mut sink, mut stream) = framed.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(256);

        let writer = {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(env) = outbound_rx.recv().await {
                    let bytes = match env.to_bytes() {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode envelope");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(bytes).await {
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
                        Some(Ok(frame)) => match Envelope::from_bytes(&frame) {
                            Ok(env) => inner.handle_envelope(env),
                            Err(e) => warn!(error = %e, "Unparseable frame"),
                        },
                        Some(Err(e)) => {
                            error!(error = %e, "Socket read failed");
                            break;
                        }
                        None => {
                            info!("cTrader stream ended");
                            break;
                        }
                    }
                }
                inner.handle_disconnect(gen);
            })
        };

        let heartbeat = {
            let outbound = outbound_tx.clone();
            let interval_ms = self.config.heartbeat_interval_ms;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let hb = Envelope::event(pt::HEARTBEAT_EVENT, json!({}));
                    if outbound.send(hb).await.is_err() {
                        break;
                    }
                }
            })
        };

        *self.conn.lock() = Some(Conn {
            outbound_tx,
            tasks: vec![writer, reader, heartbeat],
        });

        self.set_state(SessionState::Authenticating);
        self.authenticate().await?;
        self.load_symbol_catalog().await?;
        Ok(())
    }

    /// Two sequential exchanges: application auth, then account auth.
    async fn authenticate(&self) -> CtraderResult<()> {
        let res = self
            .request(
                pt::APPLICATION_AUTH_REQ,
                json!({
                    "clientId": self.config.client_id,
                    "clientSecret": self.config.client_secret,
                }),
            )
            .await
            .map_err(|e| CtraderError::AuthFailed(format!("application auth: {e}")))?;
        if res.payload_type != pt::APPLICATION_AUTH_RES {
            return Err(CtraderError::AuthFailed(format!(
                "unexpected payloadType {} to application auth",
                res.payload_type
            )));
        }

        let res = self
            .request(
                pt::ACCOUNT_AUTH_REQ,
                json!({
                    "ctidTraderAccountId": self.config.account_id,
                    "accessToken": self.config.access_token,
                }),
            )
            .await
            .map_err(|e| CtraderError::AuthFailed(format!("account auth: {e}")))?;
        if res.payload_type != pt::ACCOUNT_AUTH_RES {
            return Err(CtraderError::AuthFailed(format!(
                "unexpected payloadType {} to account auth",
                res.payload_type
            )));
        }
        debug!("Authenticated");
        Ok(())
    }

    /// Fetch the full symbol list and rebuild the name/id maps.
    /// Detail cache is invalidated: digits may differ across sessions.
    async fn load_symbol_catalog(&self) -> CtraderResult<()> {
        let res = self
            .request(
                pt::SYMBOLS_LIST_REQ,
                json!({ "ctidTraderAccountId": self.config.account_id }),
            )
            .await?;
        let list: SymbolsListPayload = serde_json::from_value(res.payload)?;

        let mut by_name = self.symbols_by_name.write();
        let mut by_id = self.symbols_by_id.write();
        by_name.clear();
        by_id.clear();
        for sym in &list.symbol {
            by_name.insert(sym.symbol_name.clone(), sym.symbol_id);
            by_id.insert(sym.symbol_id, sym.symbol_name.clone());
        }
        self.symbol_info.write().clear();
        info!(count = list.symbol.len(), "Symbol catalog loaded");
        Ok(())
    }

    /// Lazily fetch and cache per-symbol digits/pip data.
    async fn ensure_symbol_info(&self, id: i64) -> CtraderResult<SymbolInfo> {
        if let Some(info) = self.symbol_info.read().get(&id) {
            return Ok(info.clone());
        }
        let res = self
            .request(
                pt::SYMBOL_BY_ID_REQ,
                json!({
                    "ctidTraderAccountId": self.config.account_id,
                    "symbolId": [id],
                }),
            )
            .await?;
        let payload: SymbolByIdPayload = serde_json::from_value(res.payload)?;
        let details = payload
            .symbol
            .first()
            .ok_or_else(|| CtraderError::UnknownSymbol(format!("id {id}")))?;
        let name = self
            .symbols_by_id
            .read()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        let info = SymbolInfo {
            symbol_id: details.symbol_id,
            symbol_name: name,
            digits: details.digits,
            pip_position: details.pip_position,
        };
        self.symbol_info.write().insert(id, info.clone());
        Ok(info)
    }

    /// Re-issue spot and live-bar subscriptions after a reconnect.
    async fn restore_subscriptions(&self) {
        let spot_ids: Vec<i64> = self.spot_subs.lock().iter().copied().collect();
        for id in spot_ids {
            let result = self
                .request(
                    pt::SUBSCRIBE_SPOTS_REQ,
                    json!({
                        "ctidTraderAccountId": self.config.account_id,
                        "symbolId": [id],
                    }),
                )
                .await;
            if let Err(e) = result {
                warn!(id, error = %e, "Spot resubscribe failed");
            }
        }
        let bar_ids: Vec<i64> = self.bar_subs.lock().iter().copied().collect();
        for id in bar_ids {
            let result = self
                .request(
                    pt::SUBSCRIBE_LIVE_TRENDBAR_REQ,
                    json!({
                        "ctidTraderAccountId": self.config.account_id,
                        "symbolId": id,
                        "period": period::M1,
                    }),
                )
                .await;
            if let Err(e) = result {
                warn!(id, error = %e, "Trendbar resubscribe failed");
            }
        }
    }

    async fn request(&self, payload_type: u32, payload: serde_json::Value) -> CtraderResult<Envelope> {
        let msg_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg_id.clone(), tx);

        let outbound = self.conn.lock().as_ref().map(|c| c.outbound_tx.clone());
        let Some(outbound) = outbound else {
            self.pending.lock().remove(&msg_id);
            return Err(CtraderError::NotConnected);
        };

        let env = Envelope::request(payload_type, msg_id.clone(), payload);
        if outbound.send(env).await.is_err() {
            self.pending.lock().remove(&msg_id);
            return Err(CtraderError::NotConnected);
        }

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => {
                if envelope.payload_type == pt::ERROR_RES {
                    let err: ErrorPayload = serde_json::from_value(envelope.payload)?;
                    Err(CtraderError::Upstream {
                        code: err.error_code,
                        description: err.description,
                    })
                } else {
                    Ok(envelope)
                }
            }
            // Sender dropped: connection was torn down mid-request.
            Ok(Err(_)) => Err(CtraderError::NotConnected),
            Err(_) => {
                self.pending.lock().remove(&msg_id);
                Err(CtraderError::Timeout(format!("payloadType {payload_type}")))
            }
        }
    }

    fn handle_envelope(&self, env: Envelope) {
        if let Some(msg_id) = &env.client_msg_id {
            if let Some(tx) = self.pending.lock().remove(msg_id) {
                let _ = tx.send(env);
            } else {
                debug!(msg_id = %msg_id, "Response with no pending request");
            }
            return;
        }

        match env.payload_type {
            pt::SPOT_EVENT => self.handle_spot_event(env.payload),
            pt::HEARTBEAT_EVENT => debug!("Heartbeat from upstream"),
            pt::ERROR_RES => warn!(payload = %env.payload, "Unsolicited error from upstream"),
            other => debug!(payload_type = other, "Ignoring event"),
        }
    }

    /// Normalize one spot event. Trendbar attachments become an M1 bar
    /// plus a close-derived tick; a bid/ask pair becomes a quote tick
    /// after the uncrossed-book check.
    fn handle_spot_event(&self, payload: serde_json::Value) {
        let spot: SpotEventPayload = match serde_json::from_value(payload) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Malformed spot event");
                return;
            }
        };

        let Some(symbol) = self.symbols_by_id.read().get(&spot.symbol_id).cloned() else {
            debug!(symbol_id = spot.symbol_id, "Spot for unknown symbol");
            return;
        };
        let Some(info) = self.symbol_info.read().get(&spot.symbol_id).cloned() else {
            // Details are fetched on subscribe; an event racing that
            // fetch cannot be normalized yet.
            debug!(symbol = %symbol, "Spot before symbol details, dropping");
            return;
        };

        let now = now_ms();

        if !spot.trendbar.is_empty() {
            let latest = spot
                .trendbar
                .iter()
                .max_by_key(|b| b.utc_timestamp_in_minutes)
                .copied()
                .unwrap_or(spot.trendbar[0]);
            let bar = m1_from_wire(&symbol, &latest, info.digits);
            let tick = Tick::from_last_price(
                symbol.clone(),
                Source::Ctrader,
                bar.close,
                now,
                Some(info.pip()),
            );
            let _ = self.event_tx.send(SessionEvent::M1Bar(bar));
            if tick.is_valid() {
                self.health.record_tick();
                let _ = self.event_tx.send(SessionEvent::Tick(tick));
            } else {
                debug!(symbol = %symbol, "Dropping invalid trendbar tick");
            }
        }

        if let (Some(raw_bid), Some(raw_ask)) = (spot.bid, spot.ask) {
            let bid = scale_price(raw_bid, info.digits);
            let ask = scale_price(raw_ask, info.digits);
            if !bid.is_finite() || !ask.is_finite() || bid <= 0.0 || ask <= 0.0 || ask <= bid {
                debug!(symbol = %symbol, bid, ask, "Dropping invalid quote");
                return;
            }
            let tick = Tick {
                symbol,
                source: Source::Ctrader,
                bid,
                ask,
                timestamp_ms: now,
                pip: Some(info.pip()),
            };
            self.health.record_tick();
            let _ = self.event_tx.send(SessionEvent::Tick(tick));
        }
    }

    fn handle_disconnect(self: &Arc<Self>, gen: u64) {
        // Only the first handler for the current connection proceeds.
        if self
            .generation
            .compare_exchange(gen, gen + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.teardown_conn();
        self.fail_pending();
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

    /// Drop all pending request slots; waiters observe `NotConnected`.
    fn fail_pending(&self) {
        self.pending.lock().clear();
    }
}

async fn forward_health_events(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<HealthEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            HealthEvent::Stale => {
                if *inner.state.read() == SessionState::Connected {
                    inner.set_state(SessionState::Degraded);
                }
                let _ = inner.event_tx.send(SessionEvent::Stale {
                    source: Source::Ctrader,
                });
            }
            HealthEvent::TickResumed => {
                if *inner.state.read() == SessionState::Degraded {
                    inner.set_state(SessionState::Connected);
                }
                let _ = inner.event_tx.send(SessionEvent::TickResumed {
                    source: Source::Ctrader,
                });
            }
        }
    }
}

fn daily_from_wire(bar: &WireTrendbar, digits: i32) -> DailyBar {
    DailyBar {
        open: scale_price(bar.low + bar.delta_open, digits),
        high: scale_price(bar.low + bar.delta_high, digits),
        low: scale_price(bar.low, digits),
        close: scale_price(bar.low + bar.delta_close, digits),
        timestamp_ms: bar.timestamp_ms(),
    }
}

fn m1_from_wire(symbol: &str, bar: &WireTrendbar, digits: i32) -> M1Bar {
    M1Bar {
        symbol: symbol.to_string(),
        source: Source::Ctrader,
        open: scale_price(bar.low + bar.delta_open, digits),
        high: scale_price(bar.low + bar.delta_high, digits),
        low: scale_price(bar.low, digits),
        close: scale_price(bar.low + bar.delta_close, digits),
        timestamp_ms: bar.timestamp_ms(),
    }
}

/// Assemble the bootstrap package from parsed history.
///
/// Requires at least two daily bars (the most recent one is today's
/// partial). Today's OHLC prefers intraday M1 bars; with none yet, the
/// open falls back to the previous daily close and high/low to the
/// last daily bar.
fn build_package(
    symbol: &str,
    info: &SymbolInfo,
    daily: Vec<DailyBar>,
    m1_bars: Vec<M1Bar>,
    adr_lookback_days: usize,
) -> CtraderResult<SymbolDataPackage> {
    if daily.len() < 2 {
        return Err(CtraderError::InsufficientHistory {
            symbol: symbol.to_string(),
            got: daily.len(),
        });
    }

    let adr = average_daily_range(&daily, adr_lookback_days);
    let last_daily = daily[daily.len() - 1];
    let prev_daily = daily[daily.len() - 2];

    let (todays_open, todays_high, todays_low) = match intraday_ohlc(&m1_bars) {
        Some(ohlc) => (ohlc.open, ohlc.high, ohlc.low),
        None => (prev_daily.close, last_daily.high, last_daily.low),
    };
    let initial_price = m1_bars
        .last()
        .map(|b| b.close)
        .unwrap_or(last_daily.close);

    let pip = info.pip();
    Ok(SymbolDataPackage {
        symbol: symbol.to_string(),
        source: Source::Ctrader,
        digits: info.digits,
        adr,
        todays_open,
        todays_high,
        todays_low,
        projected_adr_high: todays_open + adr / 2.0,
        projected_adr_low: todays_open - adr / 2.0,
        initial_price,
        initial_market_profile: m1_bars,
        pip_position: info.pip_position,
        pip_size: pip.pip_size,
        pipette_size: pip.pipette_size,
        prev_day_open: Some(prev_daily.open),
        prev_day_high: Some(prev_daily.high),
        prev_day_low: Some(prev_daily.low),
        prev_day_close: Some(prev_daily.close),
        bucket_size: Some(bucket_size_for(symbol)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SymbolInfo {
        SymbolInfo {
            symbol_id: 1,
            symbol_name: "EURUSD".to_string(),
            digits: 5,
            pip_position: 4,
        }
    }

    fn daily(open: f64, high: f64, low: f64, close: f64, ts: i64) -> DailyBar {
        DailyBar {
            open,
            high,
            low,
            close,
            timestamp_ms: ts,
        }
    }

    fn m1(open: f64, high: f64, low: f64, close: f64, ts: i64) -> M1Bar {
        M1Bar {
            symbol: "EURUSD".to_string(),
            source: Source::Ctrader,
            open,
            high,
            low,
            close,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn test_wire_bar_conversion() {
        let wire = WireTrendbar {
            low: 108_000,
            delta_open: 100,
            delta_high: 600,
            delta_close: 500,
            utc_timestamp_in_minutes: 28_400_000,
        };
        let bar = m1_from_wire("EURUSD", &wire, 5);
        assert_eq!(bar.low, 1.08);
        assert_eq!(bar.open, 1.081);
        assert_eq!(bar.high, 1.086);
        assert_eq!(bar.close, 1.085);
        assert_eq!(bar.timestamp_ms, 28_400_000i64 * 60_000);
    }

    #[test]
    fn test_build_package_projected_range_spans_adr() {
        let daily = vec![
            daily(1.08, 1.09, 1.07, 1.085, 1),
            daily(1.085, 1.095, 1.075, 1.09, 2),
            daily(1.09, 1.10, 1.08, 1.088, 3),
        ];
        let m1_bars = vec![
            m1(1.088, 1.090, 1.087, 1.089, 10),
            m1(1.089, 1.092, 1.088, 1.091, 11),
        ];
        let pkg = build_package("EURUSD", &info(), daily, m1_bars, 14).unwrap();

        assert_eq!(pkg.todays_open, 1.088);
        assert_eq!(pkg.todays_high, 1.092);
        assert_eq!(pkg.todays_low, 1.087);
        assert_eq!(pkg.initial_price, 1.091);
        let spread = pkg.projected_adr_high - pkg.projected_adr_low;
        assert!((spread - pkg.adr).abs() < 1e-12);
        assert_eq!(pkg.prev_day_close, Some(1.09));
        assert_eq!(pkg.bucket_size, Some(0.0001));
        assert_eq!(pkg.pip_size, 0.0001);
    }

    #[test]
    fn test_build_package_no_intraday_falls_back_to_daily() {
        let daily = vec![
            daily(1.08, 1.09, 1.07, 1.085, 1),
            daily(1.085, 1.095, 1.075, 1.09, 2),
        ];
        let pkg = build_package("EURUSD", &info(), daily, Vec::new(), 14).unwrap();
        // Open falls back to the previous daily close.
        assert_eq!(pkg.todays_open, 1.085);
        assert_eq!(pkg.todays_high, 1.095);
        assert_eq!(pkg.todays_low, 1.075);
        assert_eq!(pkg.initial_price, 1.09);
        assert!(pkg.initial_market_profile.is_empty());
    }

    #[test]
    fn test_build_package_requires_two_daily_bars() {
        let result = build_package(
            "EURUSD",
            &info(),
            vec![daily(1.0, 1.0, 1.0, 1.0, 1)],
            Vec::new(),
            14,
        );
        assert!(matches!(
            result,
            Err(CtraderError::InsufficientHistory { got: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_spot_event_normalization_and_validity() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = CtraderSession::new(CtraderConfig::default(), tx);
        session
            .inner
            .symbols_by_id
            .write()
            .insert(1, "EURUSD".to_string());
        session.inner.symbol_info.write().insert(1, info());

        // Valid quote.
        session.inner.handle_spot_event(json!({
            "symbolId": 1, "bid": 108_500, "ask": 108_510
        }));
        match rx.try_recv().unwrap() {
            SessionEvent::Tick(t) => {
                assert_eq!(t.bid, 1.085);
                assert_eq!(t.ask, 1.0851);
                assert_eq!(t.source, Source::Ctrader);
                assert!(t.pip.is_some());
            }
            other => panic!("expected tick, got {other:?}"),
        }

        // Crossed book is dropped.
        session.inner.handle_spot_event(json!({
            "symbolId": 1, "bid": 108_520, "ask": 108_510
        }));
        assert!(rx.try_recv().is_err());

        // Unknown symbol is dropped.
        session.inner.handle_spot_event(json!({
            "symbolId": 99, "bid": 108_500, "ask": 108_510
        }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spot_event_trendbar_variant_emits_bar_then_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = CtraderSession::new(CtraderConfig::default(), tx);
        session
            .inner
            .symbols_by_id
            .write()
            .insert(1, "EURUSD".to_string());
        session.inner.symbol_info.write().insert(1, info());

        session.inner.handle_spot_event(json!({
            "symbolId": 1,
            "trendbar": [{
                "low": 108_000, "deltaOpen": 100, "deltaHigh": 600,
                "deltaClose": 500, "utcTimestampInMinutes": 28_400_000
            }]
        }));

        match rx.try_recv().unwrap() {
            SessionEvent::M1Bar(bar) => {
                assert_eq!(bar.close, 1.085);
                assert_eq!(bar.symbol, "EURUSD");
            }
            other => panic!("expected m1 bar, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            SessionEvent::Tick(t) => {
                assert_eq!(t.bid, 1.085);
                assert_eq!(t.ask, 1.085);
            }
            other => panic!("expected tick, got {other:?}"),
        }
        assert_eq!(session.inner.health.last_tick_ms().is_some(), true);
    }

    #[tokio::test]
    async fn test_disconnect_closes_and_blocks_requests() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = CtraderSession::new(CtraderConfig::default(), tx);
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
        // State change event was emitted.
        match rx.try_recv().unwrap() {
            SessionEvent::StateChanged { state, .. } => assert_eq!(state, SessionState::Closed),
            other => panic!("unexpected {other:?}"),
        }
        // No connection: requests fail immediately.
        let err = session
            .inner
            .request(pt::SYMBOLS_LIST_REQ, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CtraderError::NotConnected));
    }
}
