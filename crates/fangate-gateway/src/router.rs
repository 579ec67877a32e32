//! Output fan-out.
//!
//! Builds the wire message for each upstream event, serializes once,
//! and writes to every subscriber of the `(symbol, source)` key.
//! Writes to closed or backed-up clients are swallowed (the hub drops
//! the client). Profile and TWAP updates go to subscribers of both
//! source variants of a symbol, since those services do not track
//! which source fed them.

use std::sync::Arc;

use fangate_analytics::AnalyticsEvent;
use fangate_core::{Source, SymbolDataPackage, Tick};

use crate::hub::ClientHub;
use crate::registry::{ClientId, SubscriptionRegistry};
use crate::wire::{
    GatewayStatus, ProfileLevelPayload, ProfilePayload, ServerMessage, TickBody,
};

/// Stateless message builder plus broadcaster.
pub struct DataRouter {
    registry: Arc<SubscriptionRegistry>,
    hub: Arc<ClientHub>,
}

impl DataRouter {
    pub fn new(registry: Arc<SubscriptionRegistry>, hub: Arc<ClientHub>) -> Self {
        Self { registry, hub }
    }

    /// Fan a tick out to its key's subscribers.
    pub fn route_tick(&self, tick: &Tick) {
        let body = match tick.source {
            Source::Ctrader => TickBody::Quote {
                source: tick.source,
                symbol: tick.symbol.clone(),
                bid: tick.bid,
                ask: tick.ask,
                timestamp: tick.timestamp_ms,
                pip_position: tick.pip.map(|p| p.pip_position),
                pip_size: tick.pip.map(|p| p.pip_size),
                pipette_size: tick.pip.map(|p| p.pipette_size),
            },
            Source::Tradingview => TickBody::Chart {
                source: tick.source,
                symbol: tick.symbol.clone(),
                price: tick.bid,
                current: tick.bid,
                timestamp: tick.timestamp_ms,
            },
        };
        let text = ServerMessage::Tick(body).to_text();
        for client in self.registry.subscribers(&tick.symbol, tick.source) {
            self.hub.send_to(client, &text);
        }
    }

    /// Fan a package out to the key's current subscribers.
    pub fn route_package(&self, package: &SymbolDataPackage, exclude: &[ClientId]) {
        let text = ServerMessage::Package(package.clone()).to_text();
        for client in self.registry.subscribers(&package.symbol, package.source) {
            if !exclude.contains(&client) {
                self.hub.send_to(client, &text);
            }
        }
    }

    /// Fan an analytics event out to the symbol's subscribers on both
    /// sources.
    pub fn route_analytics(&self, event: &AnalyticsEvent) {
        let (symbol, message) = match event {
            AnalyticsEvent::ProfileUpdate {
                symbol,
                levels,
                bucket_size,
                seq,
                source,
            } => (
                symbol.clone(),
                ServerMessage::ProfileUpdate {
                    symbol: symbol.clone(),
                    profile: ProfilePayload {
                        levels: levels
                            .iter()
                            .map(|l| ProfileLevelPayload {
                                price: l.price,
                                tpo: l.tpo,
                            })
                            .collect(),
                        bucket_size: *bucket_size,
                    },
                    seq: *seq,
                    source: *source,
                },
            ),
            AnalyticsEvent::ProfileError {
                symbol,
                code,
                message,
            } => (
                symbol.clone(),
                ServerMessage::ProfileError {
                    symbol: symbol.clone(),
                    error: code.clone(),
                    message: message.clone(),
                },
            ),
            AnalyticsEvent::TwapUpdate {
                symbol,
                source,
                twap_value,
                timestamp_ms,
                contributions,
                is_historical,
            } => (
                symbol.clone(),
                ServerMessage::TwapUpdate {
                    symbol: symbol.clone(),
                    source: *source,
                    twap_value: *twap_value,
                    timestamp: *timestamp_ms,
                    contributions: *contributions,
                    is_historical: *is_historical,
                },
            ),
            AnalyticsEvent::TwapError {
                symbol,
                code,
                message,
            } => (
                symbol.clone(),
                ServerMessage::Error {
                    symbol: Some(symbol.clone()),
                    message: format!("{code}: {message}"),
                },
            ),
        };

        let text = message.to_text();
        for client in self.registry.subscribers_any_source(&symbol) {
            self.hub.send_to(client, &text);
        }
    }

    /// Per-symbol error to the symbol's subscribers plus explicit
    /// recipients (e.g. parked bootstrap waiters).
    pub fn route_symbol_error(&self, symbol: &str, message: &str, extra: &[ClientId]) {
        let text = ServerMessage::Error {
            symbol: Some(symbol.to_string()),
            message: message.to_string(),
        }
        .to_text();
        for client in extra {
            self.hub.send_to(*client, &text);
        }
        for client in self.registry.subscribers_any_source(symbol) {
            if !extra.contains(&client) {
                self.hub.send_to(client, &text);
            }
        }
    }

    /// Status goes to every connected client, not just subscribers.
    pub fn broadcast_status(
        &self,
        status: GatewayStatus,
        available_symbols: Vec<String>,
        message: Option<String>,
    ) {
        let text = ServerMessage::Status {
            status,
            available_symbols,
            message,
        }
        .to_text();
        self.hub.broadcast(&text);
    }

    /// Ready broadcast after the upstream becomes fully connected.
    pub fn broadcast_ready(&self, available_symbols: Vec<String>) {
        let text = ServerMessage::Ready { available_symbols }.to_text();
        self.hub.broadcast(&text);
    }
}
