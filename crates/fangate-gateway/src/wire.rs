//! Downstream wire schema.
//!
//! A closed set of JSON messages: clients deserialize into
//! [`ClientMessage`], everything the server writes serializes from
//! [`ServerMessage`]. Optional fields are explicit options, never
//! absent-when-undefined ambiguities.

use serde::{Deserialize, Serialize};

use fangate_core::{Source, SymbolDataPackage};

/// Messages a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    GetSymbolDataPackage {
        symbol: String,
        #[serde(rename = "adrLookbackDays", default)]
        adr_lookback_days: Option<usize>,
    },
    Subscribe {
        symbols: Vec<String>,
    },
    Unsubscribe {
        symbols: Vec<String>,
    },
    Reinit {
        source: ReinitSource,
    },
}

/// Reinit target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReinitSource {
    Ctrader,
    Tradingview,
    All,
}

impl std::fmt::Display for ReinitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ctrader => write!(f, "ctrader"),
            Self::Tradingview => write!(f, "tradingview"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Gateway status values broadcast to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayStatus {
    Disconnected,
    WsConnecting,
    WsOpen,
    CtraderConnecting,
    Connected,
    Error,
}

/// Tick message body; shape differs per source.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TickBody {
    /// Provider-A shape: bid/ask with optional pip metadata.
    #[serde(rename_all = "camelCase")]
    Quote {
        source: Source,
        symbol: String,
        bid: f64,
        ask: f64,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pip_position: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pip_size: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pipette_size: Option<f64>,
    },
    /// Provider-B shape: single price.
    Chart {
        source: Source,
        symbol: String,
        price: f64,
        current: f64,
        timestamp: i64,
    },
}

/// Profile payload: ascending levels plus the bucket size.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePayload {
    pub levels: Vec<ProfileLevelPayload>,
    pub bucket_size: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileLevelPayload {
    pub price: f64,
    pub tpo: u32,
}

/// Messages the server may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "status", rename_all = "camelCase")]
    Status {
        status: GatewayStatus,
        available_symbols: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "ready", rename_all = "camelCase")]
    Ready { available_symbols: Vec<String> },
    #[serde(rename = "symbolDataPackage")]
    Package(SymbolDataPackage),
    #[serde(rename = "tick")]
    Tick(TickBody),
    #[serde(rename = "profileUpdate")]
    ProfileUpdate {
        symbol: String,
        profile: ProfilePayload,
        seq: u64,
        source: Source,
    },
    #[serde(rename = "twapUpdate", rename_all = "camelCase")]
    TwapUpdate {
        symbol: String,
        source: Source,
        twap_value: f64,
        timestamp: i64,
        contributions: u64,
        is_historical: bool,
    },
    #[serde(rename = "profileError")]
    ProfileError {
        symbol: String,
        error: String,
        message: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        message: String,
    },
    #[serde(rename = "reinit_started")]
    ReinitStarted { source: ReinitSource, timestamp: i64 },
}

impl ServerMessage {
    /// Serialize once for fan-out.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Wire serialization failed");
            String::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "get_symbol_data_package",
            "symbol": "EURUSD",
            "adrLookbackDays": 20
        }))
        .unwrap();
        match msg {
            ClientMessage::GetSymbolDataPackage {
                symbol,
                adr_lookback_days,
            } => {
                assert_eq!(symbol, "EURUSD");
                assert_eq!(adr_lookback_days, Some(20));
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "subscribe", "symbols": ["EURUSD"]})).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { .. }));

        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "reinit", "source": "all"})).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Reinit {
                source: ReinitSource::All
            }
        ));

        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "bogus"})).is_err());
    }

    #[test]
    fn test_lookback_defaults_to_none() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "get_symbol_data_package",
            "symbol": "EURUSD"
        }))
        .unwrap();
        match msg {
            ClientMessage::GetSymbolDataPackage {
                adr_lookback_days, ..
            } => assert_eq!(adr_lookback_days, None),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_status_wire_names() {
        let text = serde_json::to_string(&GatewayStatus::CtraderConnecting).unwrap();
        assert_eq!(text, "\"ctrader-connecting\"");
        let text = serde_json::to_string(&GatewayStatus::WsOpen).unwrap();
        assert_eq!(text, "\"ws-open\"");
    }

    #[test]
    fn test_quote_tick_serialization() {
        let msg = ServerMessage::Tick(TickBody::Quote {
            source: Source::Ctrader,
            symbol: "EURUSD".to_string(),
            bid: 1.085,
            ask: 1.0851,
            timestamp: 1_700_000_000_000,
            pip_position: Some(4),
            pip_size: Some(0.0001),
            pipette_size: Some(0.00001),
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_text()).unwrap();
        assert_eq!(value["type"], "tick");
        assert_eq!(value["source"], "ctrader");
        assert_eq!(value["bid"], 1.085);
        assert_eq!(value["pipPosition"], 4);
        assert!(value.get("price").is_none());
    }

    #[test]
    fn test_chart_tick_serialization() {
        let msg = ServerMessage::Tick(TickBody::Chart {
            source: Source::Tradingview,
            symbol: "EURUSD".to_string(),
            price: 1.085,
            current: 1.085,
            timestamp: 1_700_000_000_000,
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_text()).unwrap();
        assert_eq!(value["type"], "tick");
        assert_eq!(value["source"], "tradingview");
        assert_eq!(value["price"], 1.085);
        assert_eq!(value["current"], 1.085);
        assert!(value.get("bid").is_none());
    }

    #[test]
    fn test_error_omits_null_symbol() {
        let msg = ServerMessage::Error {
            symbol: None,
            message: "malformed message".to_string(),
        };
        assert!(!msg.to_text().contains("symbol"));
    }

    #[test]
    fn test_profile_update_shape() {
        let msg = ServerMessage::ProfileUpdate {
            symbol: "EURUSD".to_string(),
            profile: ProfilePayload {
                levels: vec![ProfileLevelPayload {
                    price: 1.085,
                    tpo: 3,
                }],
                bucket_size: 0.0001,
            },
            seq: 7,
            source: Source::Ctrader,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_text()).unwrap();
        assert_eq!(value["type"], "profileUpdate");
        assert_eq!(value["profile"]["bucketSize"], 0.0001);
        assert_eq!(value["profile"]["levels"][0]["tpo"], 3);
        assert_eq!(value["seq"], 7);
    }
}
