//! Gateway core: client dispatch and the event pump.
//!
//! The gateway owns the subscription registry, the per-client queues,
//! the coalescing coordinator, and the analytics services, and runs
//! the loop that pumps session, analytics, and coordinator events into
//! the data router.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fangate_analytics::{AnalyticsEvent, MarketProfileService, TwapService};
use fangate_core::bars::now_ms;
use fangate_core::{bucket_size_for, SessionEvent, SessionState, Source, SymbolDataPackage};
use fangate_telemetry::metrics;

use crate::coordinator::{CoordinatorConfig, CoordinatorEvent, RequestCoordinator};
use crate::hub::{ClientHub, DEFAULT_QUEUE_CAPACITY};
use crate::registry::{ClientId, SubscriptionRegistry};
use crate::router::DataRouter;
use crate::upstream::Upstream;
use crate::wire::{ClientMessage, GatewayStatus, ServerMessage};

/// Gateway configuration.
#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    /// Per-client outbound queue capacity; overflow disconnects.
    pub queue_capacity: usize,
    pub coordinator: CoordinatorConfig,
    pub default_adr_lookback_days: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            coordinator: CoordinatorConfig::default(),
            default_adr_lookback_days: fangate_core::DEFAULT_ADR_LOOKBACK_DAYS,
        }
    }
}

/// Downstream gateway.
pub struct Gateway {
    registry: Arc<SubscriptionRegistry>,
    hub: Arc<ClientHub>,
    router: DataRouter,
    coordinator: Arc<RequestCoordinator>,
    upstream: Arc<dyn Upstream>,
    profile: Arc<MarketProfileService>,
    twap: Arc<TwapService>,
    status: RwLock<GatewayStatus>,
    config: GatewayConfig,
}

impl Gateway {
    /// Build the gateway and the receiver for coordinator outcomes,
    /// which must be passed to [`Gateway::run`].
    pub fn new(
        upstream: Arc<dyn Upstream>,
        profile: Arc<MarketProfileService>,
        twap: Arc<TwapService>,
        config: GatewayConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let hub = Arc::new(ClientHub::new());
        let router = DataRouter::new(Arc::clone(&registry), Arc::clone(&hub));
        let (coord_tx, coord_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(RequestCoordinator::new(
            Arc::clone(&upstream),
            config.coordinator,
            coord_tx,
        ));

        let gateway = Arc::new(Self {
            registry,
            hub,
            router,
            coordinator,
            upstream,
            profile,
            twap,
            status: RwLock::new(GatewayStatus::Disconnected),
            config,
        });
        (gateway, coord_rx)
    }

    pub fn status(&self) -> GatewayStatus {
        *self.status.read()
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_capacity
    }

    /// Pump session, analytics, and coordinator events until every
    /// channel closes.
    pub async fn run(
        self: Arc<Self>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut analytics_rx: mpsc::UnboundedReceiver<AnalyticsEvent>,
        mut coordinator_rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
    ) {
        loop {
            tokio::select! {
                event = session_rx.recv() => match event {
                    Some(event) => self.handle_session_event(event),
                    None => break,
                },
                event = analytics_rx.recv() => {
                    if let Some(event) = event {
                        self.router.route_analytics(&event);
                    }
                }
                event = coordinator_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_coordinator_event(event);
                    }
                }
            }
        }
        info!("Gateway event pump stopped");
    }

    /// One upstream session event.
    pub fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Tick(tick) => {
                metrics::TICKS_RECEIVED
                    .with_label_values(&[&tick.source.to_string()])
                    .inc();
                self.router.route_tick(&tick);
            }
            SessionEvent::M1Bar(bar) => {
                metrics::BARS_RECEIVED
                    .with_label_values(&[&bar.source.to_string()])
                    .inc();
                self.profile.on_m1_bar(&bar.symbol, &bar);
                self.twap.on_m1_bar(&bar.symbol, &bar, bar.source);
            }
            SessionEvent::Package(package) => self.handle_package(*package),
            SessionEvent::Stale { source } => {
                metrics::STALE_TRANSITIONS
                    .with_label_values(&[&source.to_string()])
                    .inc();
                self.router.broadcast_status(
                    GatewayStatus::Error,
                    self.upstream.available_symbols(),
                    Some(format!("{source} tick stream stale")),
                );
            }
            SessionEvent::TickResumed { source } => {
                self.router.broadcast_status(
                    self.status(),
                    self.upstream.available_symbols(),
                    Some(format!("{source} ticks resumed")),
                );
            }
            SessionEvent::StateChanged { source, state } => self.handle_state_change(source, state),
            SessionEvent::SymbolError {
                source,
                symbol,
                message,
            } => {
                let waiters = if source == Source::Tradingview {
                    self.coordinator.take_chart_waiters(&symbol)
                } else {
                    Vec::new()
                };
                self.router.route_symbol_error(&symbol, &message, &waiters);
            }
        }
    }

    fn handle_state_change(&self, source: Source, state: SessionState) {
        let connected = i64::from(state == SessionState::Connected);
        metrics::SESSION_CONNECTED
            .with_label_values(&[&source.to_string()])
            .set(connected);

        match source {
            Source::Ctrader => {
                let status = map_ctrader_state(state);
                *self.status.write() = status;
                self.router
                    .broadcast_status(status, self.upstream.available_symbols(), None);
                if state == SessionState::Connected {
                    self.router.broadcast_ready(self.upstream.available_symbols());
                }
            }
            Source::Tradingview => {
                // The headline status tracks provider A; provider B
                // transitions are reported in the message field.
                self.router.broadcast_status(
                    self.status(),
                    self.upstream.available_symbols(),
                    Some(format!("tradingview {state}")),
                );
            }
        }
    }

    /// A provider-B bootstrap package from the session.
    fn handle_package(&self, package: SymbolDataPackage) {
        let bucket = package
            .bucket_size
            .unwrap_or_else(|| bucket_size_for(&package.symbol));
        self.profile.initialize_from_history(
            &package.symbol,
            &package.initial_market_profile,
            bucket,
            package.source,
        );
        self.twap.initialize_from_history(
            &package.symbol,
            &package.initial_market_profile,
            package.source,
        );

        metrics::PACKAGES_SERVED
            .with_label_values(&[&package.source.to_string()])
            .inc();

        // Waiters get the package first, then join the fan-out set;
        // existing subscribers are re-bootstrapped via broadcast.
        let waiters = self.coordinator.take_chart_waiters(&package.symbol);
        self.router.route_package(&package, &waiters);
        let text = ServerMessage::Package(package.clone()).to_text();
        for waiter in &waiters {
            self.hub.send_to(*waiter, &text);
            self.registry.add(*waiter, &package.symbol, package.source);
        }
        // M1 bars ride the chart session; only the tracking set changes.
        self.registry.add_m1(&package.symbol, package.source);
    }

    /// One coordinator outcome (provider-A fetch).
    pub fn handle_coordinator_event(&self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::PackageReady { waiters, package } => {
                let symbol = package.symbol.clone();
                let source = package.source;
                let bucket = package
                    .bucket_size
                    .unwrap_or_else(|| bucket_size_for(&symbol));
                self.profile.initialize_from_history(
                    &symbol,
                    &package.initial_market_profile,
                    bucket,
                    source,
                );
                self.twap
                    .initialize_from_history(&symbol, &package.initial_market_profile, source);

                metrics::PACKAGES_SERVED
                    .with_label_values(&[&source.to_string()])
                    .inc();

                let text = ServerMessage::Package(*package).to_text();
                for waiter in waiters {
                    // Package before fan-out registration: the queue
                    // ordering guarantees no tick precedes it.
                    self.hub.send_to(waiter, &text);
                    if self.registry.add(waiter, &symbol, source) {
                        self.spawn_subscribe_quotes(symbol.clone(), source);
                    }
                }
                if self.registry.add_m1(&symbol, source) {
                    self.spawn_subscribe_m1(symbol, source);
                }
            }
            CoordinatorEvent::PackageFailed {
                waiters,
                symbol,
                message,
            } => {
                warn!(symbol = %symbol, message = %message, "Bootstrap failed");
                self.router.route_symbol_error(&symbol, &message, &waiters);
            }
        }
    }

    /// One parsed-or-not client frame.
    pub fn handle_client_message(self: &Arc<Self>, client: ClientId, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(%client, error = %e, "Malformed client message");
                let reply = ServerMessage::Error {
                    symbol: None,
                    message: "malformed message".to_string(),
                }
                .to_text();
                self.hub.send_to(client, &reply);
                return;
            }
        };

        match message {
            ClientMessage::GetSymbolDataPackage {
                symbol,
                adr_lookback_days,
            } => {
                let lookback =
                    adr_lookback_days.unwrap_or(self.config.default_adr_lookback_days);
                self.request_bootstrap(client, &symbol, lookback);
            }
            ClientMessage::Subscribe { symbols } => match symbols.first() {
                Some(symbol) => {
                    let lookback = self.config.default_adr_lookback_days;
                    self.request_bootstrap(client, symbol, lookback);
                }
                None => {
                    let reply = ServerMessage::Error {
                        symbol: None,
                        message: "subscribe requires at least one symbol".to_string(),
                    }
                    .to_text();
                    self.hub.send_to(client, &reply);
                }
            },
            ClientMessage::Unsubscribe { symbols } => {
                for symbol in symbols {
                    for (symbol, source) in self.registry.remove(client, &symbol) {
                        self.spawn_unsubscribe(symbol, source);
                    }
                }
            }
            ClientMessage::Reinit { source } => {
                let reply = ServerMessage::ReinitStarted {
                    source,
                    timestamp: now_ms(),
                }
                .to_text();
                self.hub.send_to(client, &reply);
                let upstream = Arc::clone(&self.upstream);
                tokio::spawn(async move {
                    upstream.reinit(source).await;
                });
            }
        }
    }

    /// Route a bootstrap request to the provider that serves the
    /// symbol: catalog hits go to provider A (coalesced), everything
    /// else to provider B's chart subscription.
    fn request_bootstrap(&self, client: ClientId, symbol: &str, lookback: usize) {
        if self.upstream.is_ctrader_symbol(symbol) {
            self.coordinator.request_package(symbol, lookback, client);
        } else {
            self.coordinator.request_chart(symbol, lookback, client);
        }
    }

    /// New downstream connection: register and send status (+ ready
    /// when fully connected).
    pub fn on_client_connect(&self, client: ClientId, tx: mpsc::Sender<String>) {
        self.hub.insert(client, tx);
        self.registry.register_client(client);

        let symbols = self.upstream.available_symbols();
        let status = self.status();
        let text = ServerMessage::Status {
            status,
            available_symbols: symbols.clone(),
            message: None,
        }
        .to_text();
        self.hub.send_to(client, &text);
        if status == GatewayStatus::Connected {
            let ready = ServerMessage::Ready {
                available_symbols: symbols,
            }
            .to_text();
            self.hub.send_to(client, &ready);
        }
        info!(%client, clients = self.hub.len(), "Client connected");
    }

    /// Downstream disconnect: drop queues, release subscriptions, and
    /// unsubscribe upstream keys that dropped to zero.
    pub fn on_client_disconnect(&self, client: ClientId) {
        self.hub.remove(client);
        for (symbol, source) in self.registry.remove_client(client) {
            self.spawn_unsubscribe(symbol, source);
        }
        info!(%client, clients = self.hub.len(), "Client disconnected");
    }

    fn spawn_subscribe_quotes(&self, symbol: String, source: Source) {
        let upstream = Arc::clone(&self.upstream);
        tokio::spawn(async move {
            if let Err(e) = upstream.subscribe_quotes(&symbol, source).await {
                warn!(symbol = %symbol, %source, error = %e, "Quote subscribe failed");
            }
        });
    }

    fn spawn_subscribe_m1(&self, symbol: String, source: Source) {
        let upstream = Arc::clone(&self.upstream);
        tokio::spawn(async move {
            if let Err(e) = upstream.subscribe_m1(&symbol, source).await {
                warn!(symbol = %symbol, %source, error = %e, "M1 subscribe failed");
            }
        });
    }

    fn spawn_unsubscribe(&self, symbol: String, source: Source) {
        if self.registry.remove_m1(&symbol, source) {
            let upstream = Arc::clone(&self.upstream);
            let symbol = symbol.clone();
            tokio::spawn(async move {
                if let Err(e) = upstream.unsubscribe_m1(&symbol, source).await {
                    warn!(symbol = %symbol, %source, error = %e, "M1 unsubscribe failed");
                }
            });
        }
        let upstream = Arc::clone(&self.upstream);
        tokio::spawn(async move {
            if let Err(e) = upstream.unsubscribe_quotes(&symbol, source).await {
                warn!(symbol = %symbol, %source, error = %e, "Quote unsubscribe failed");
            }
        });
    }
}

fn map_ctrader_state(state: SessionState) -> GatewayStatus {
    match state {
        SessionState::Disconnected | SessionState::Closed => GatewayStatus::Disconnected,
        SessionState::Connecting | SessionState::Authenticating | SessionState::Reconnecting => {
            GatewayStatus::CtraderConnecting
        }
        SessionState::Connected => GatewayStatus::Connected,
        SessionState::Degraded => GatewayStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fangate_core::{M1Bar, PipInfo, Tick};
    use uuid::Uuid;

    fn upstream_mock() -> crate::upstream::MockUpstream {
        let mut upstream = crate::upstream::MockUpstream::new();
        upstream
            .expect_available_symbols()
            .returning(|| vec!["EURUSD".to_string()]);
        upstream
            .expect_is_ctrader_symbol()
            .returning(|s| !s.contains(':'));
        upstream
    }

    fn build(
        upstream: crate::upstream::MockUpstream,
    ) -> (Arc<Gateway>, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (profile_tx, _profile_rx) = mpsc::unbounded_channel();
        let (twap_tx, _twap_rx) = mpsc::unbounded_channel();
        Gateway::new(
            Arc::new(upstream),
            Arc::new(MarketProfileService::new(profile_tx)),
            Arc::new(TwapService::new(twap_tx)),
            GatewayConfig::default(),
        )
    }

    fn connect_client(gateway: &Arc<Gateway>) -> (ClientId, mpsc::Receiver<String>) {
        let client = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        gateway.on_client_connect(client, tx);
        (client, rx)
    }

    fn package(symbol: &str, source: Source) -> SymbolDataPackage {
        SymbolDataPackage {
            symbol: symbol.to_string(),
            source,
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
                source,
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
        }
    }

    #[tokio::test]
    async fn test_client_connect_gets_status_then_ready_when_connected() {
        let (gateway, _coord_rx) = build(upstream_mock());
        gateway.handle_session_event(SessionEvent::StateChanged {
            source: Source::Ctrader,
            state: SessionState::Connected,
        });

        let (_client, mut rx) = connect_client(&gateway);
        let status: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(status["type"], "status");
        assert_eq!(status["status"], "connected");
        let ready: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(ready["type"], "ready");
        assert_eq!(ready["availableSymbols"][0], "EURUSD");
    }

    #[tokio::test]
    async fn test_package_delivered_before_registration() {
        let mut upstream = upstream_mock();
        upstream.expect_subscribe_quotes().returning(|_, _| Ok(()));
        upstream.expect_subscribe_m1().returning(|_, _| Ok(()));
        let (gateway, _coord_rx) = build(upstream);

        let (client, mut rx) = connect_client(&gateway);
        let _ = rx.recv().await; // status

        gateway.handle_coordinator_event(CoordinatorEvent::PackageReady {
            waiters: vec![client],
            package: Box::new(package("EURUSD", Source::Ctrader)),
        });

        // First symbol-bearing message is the package.
        let value: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(value["type"], "symbolDataPackage");
        assert_eq!(value["symbol"], "EURUSD");

        // Now registered: a tick follows the package.
        gateway.handle_session_event(SessionEvent::Tick(Tick {
            symbol: "EURUSD".to_string(),
            source: Source::Ctrader,
            bid: 1.085,
            ask: 1.0851,
            timestamp_ms: 1,
            pip: Some(PipInfo::from_catalog(5, 4)),
        }));
        let value: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(value["type"], "tick");
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error_reply_and_connection_survives() {
        let (gateway, _coord_rx) = build(upstream_mock());
        let (client, mut rx) = connect_client(&gateway);
        let _ = rx.recv().await; // status

        gateway.handle_client_message(client, "{not json");
        let value: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert!(gateway.hub.contains(client));
    }

    #[tokio::test]
    async fn test_reinit_acks_and_invokes_upstream() {
        let mut upstream = upstream_mock();
        upstream
            .expect_reinit()
            .times(1)
            .returning(|_| ());
        let (gateway, _coord_rx) = build(upstream);
        let (client, mut rx) = connect_client(&gateway);
        let _ = rx.recv().await; // status

        gateway.handle_client_message(client, r#"{"type":"reinit","source":"all"}"#);
        let value: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(value["type"], "reinit_started");
        assert_eq!(value["source"], "all");
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_disconnect_releases_upstream_key() {
        let mut upstream = upstream_mock();
        upstream.expect_subscribe_quotes().returning(|_, _| Ok(()));
        upstream.expect_subscribe_m1().returning(|_, _| Ok(()));
        upstream
            .expect_unsubscribe_quotes()
            .times(1)
            .returning(|_, _| Ok(()));
        upstream
            .expect_unsubscribe_m1()
            .times(1)
            .returning(|_, _| Ok(()));
        let (gateway, _coord_rx) = build(upstream);

        let (client, _rx) = connect_client(&gateway);
        gateway.handle_coordinator_event(CoordinatorEvent::PackageReady {
            waiters: vec![client],
            package: Box::new(package("EURUSD", Source::Ctrader)),
        });
        assert!(gateway.registry.has_subscribers("EURUSD", Source::Ctrader));

        gateway.on_client_disconnect(client);
        assert!(!gateway.registry.has_subscribers("EURUSD", Source::Ctrader));
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_tradingview_package_drains_chart_waiters() {
        let mut upstream = upstream_mock();
        upstream.expect_subscribe_chart().returning(|_, _| Ok(()));
        let (gateway, _coord_rx) = build(upstream);

        let (client, mut rx) = connect_client(&gateway);
        let _ = rx.recv().await; // status

        gateway.handle_client_message(
            client,
            r#"{"type":"get_symbol_data_package","symbol":"FX:EURUSD"}"#,
        );
        tokio::task::yield_now().await;

        gateway.handle_session_event(SessionEvent::Package(Box::new(package(
            "FX:EURUSD",
            Source::Tradingview,
        ))));

        let value: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(value["type"], "symbolDataPackage");
        assert_eq!(value["source"], "tradingview");
        assert!(gateway
            .registry
            .has_subscribers("FX:EURUSD", Source::Tradingview));
    }

    #[tokio::test]
    async fn test_stale_broadcast_is_error_status() {
        let (gateway, _coord_rx) = build(upstream_mock());
        let (_client, mut rx) = connect_client(&gateway);
        let _ = rx.recv().await; // status

        gateway.handle_session_event(SessionEvent::Stale {
            source: Source::Ctrader,
        });
        let value: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(value["status"], "error");
        assert!(value["message"].as_str().unwrap().contains("stale"));
    }
}
