//! Reference-counted subscription registry.
//!
//! Tracks which clients subscribe to which `(symbol, source)` keys.
//! The first client on a key signals the caller to subscribe upstream;
//! a key dropping to zero signals the upstream unsubscribe. A separate
//! set tracks session-level live M1-bar subscriptions, which exist per
//! key, not per client.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use uuid::Uuid;

use fangate_core::Source;

/// Downstream client handle.
pub type ClientId = Uuid;

#[derive(Default)]
struct RegistryState {
    client_subs: HashMap<ClientId, HashSet<String>>,
    source_subs: HashMap<(String, Source), HashSet<ClientId>>,
    m1_subs: HashSet<(String, Source)>,
}

/// Concurrent subscription registry.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly connected client.
    pub fn register_client(&self, client: ClientId) {
        self.state.write().client_subs.entry(client).or_default();
    }

    /// Add a subscription; returns true when this client is the first
    /// on `(symbol, source)`.
    pub fn add(&self, client: ClientId, symbol: &str, source: Source) -> bool {
        let mut state = self.state.write();
        state
            .client_subs
            .entry(client)
            .or_default()
            .insert(symbol.to_string());
        let subs = state
            .source_subs
            .entry((symbol.to_string(), source))
            .or_default();
        let first = subs.is_empty();
        subs.insert(client);
        first
    }

    /// Remove a client's subscription to a symbol across all sources.
    /// Returns the keys whose subscriber count dropped to zero.
    pub fn remove(&self, client: ClientId, symbol: &str) -> Vec<(String, Source)> {
        let mut state = self.state.write();
        if let Some(subs) = state.client_subs.get_mut(&client) {
            subs.remove(symbol);
        }

        let mut now_empty = Vec::new();
        for source in [Source::Ctrader, Source::Tradingview] {
            let key = (symbol.to_string(), source);
            if let Some(subs) = state.source_subs.get_mut(&key) {
                if subs.remove(&client) && subs.is_empty() {
                    state.source_subs.remove(&key);
                    now_empty.push(key);
                }
            }
        }
        now_empty
    }

    /// Whole-client removal on disconnect. Returns keys that dropped
    /// to zero.
    pub fn remove_client(&self, client: ClientId) -> Vec<(String, Source)> {
        let symbols: Vec<String> = {
            let mut state = self.state.write();
            state
                .client_subs
                .remove(&client)
                .map(|s| s.into_iter().collect())
                .unwrap_or_default()
        };

        let mut now_empty = Vec::new();
        for symbol in symbols {
            let mut state = self.state.write();
            for source in [Source::Ctrader, Source::Tradingview] {
                let key = (symbol.clone(), source);
                if let Some(subs) = state.source_subs.get_mut(&key) {
                    if subs.remove(&client) && subs.is_empty() {
                        state.source_subs.remove(&key);
                        now_empty.push(key);
                    }
                }
            }
        }
        now_empty
    }

    /// Subscriber snapshot for fan-out.
    pub fn subscribers(&self, symbol: &str, source: Source) -> Vec<ClientId> {
        self.state
            .read()
            .source_subs
            .get(&(symbol.to_string(), source))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Subscribers of a symbol across both sources, deduplicated.
    pub fn subscribers_any_source(&self, symbol: &str) -> Vec<ClientId> {
        let state = self.state.read();
        let mut out = HashSet::new();
        for source in [Source::Ctrader, Source::Tradingview] {
            if let Some(subs) = state.source_subs.get(&(symbol.to_string(), source)) {
                out.extend(subs.iter().copied());
            }
        }
        out.into_iter().collect()
    }

    /// Track a session-level M1-bar subscription. Returns true when
    /// newly inserted (caller subscribes upstream).
    pub fn add_m1(&self, symbol: &str, source: Source) -> bool {
        self.state
            .write()
            .m1_subs
            .insert((symbol.to_string(), source))
    }

    /// Drop a session-level M1-bar subscription. Returns true when it
    /// existed.
    pub fn remove_m1(&self, symbol: &str, source: Source) -> bool {
        self.state
            .write()
            .m1_subs
            .remove(&(symbol.to_string(), source))
    }

    pub fn has_subscribers(&self, symbol: &str, source: Source) -> bool {
        self.state
            .read()
            .source_subs
            .contains_key(&(symbol.to_string(), source))
    }

    pub fn client_count(&self) -> usize {
        self.state.read().client_subs.len()
    }
}
