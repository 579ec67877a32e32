//! cTrader Open API message set.
//!
//! Every frame carries a JSON envelope `{ payloadType, clientMsgId?,
//! payload }`. Request/response pairs correlate by `clientMsgId`;
//! server-push events (spots, heartbeats) carry none.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload type identifiers (subset of ProtoOAPayloadType).
pub mod payload_type {
    pub const HEARTBEAT_EVENT: u32 = 51;
    pub const APPLICATION_AUTH_REQ: u32 = 2100;
    pub const APPLICATION_AUTH_RES: u32 = 2101;
    pub const ACCOUNT_AUTH_REQ: u32 = 2102;
    pub const ACCOUNT_AUTH_RES: u32 = 2103;
    pub const SYMBOLS_LIST_REQ: u32 = 2114;
    pub const SYMBOLS_LIST_RES: u32 = 2115;
    pub const SYMBOL_BY_ID_REQ: u32 = 2116;
    pub const SYMBOL_BY_ID_RES: u32 = 2117;
    pub const SUBSCRIBE_SPOTS_REQ: u32 = 2127;
    pub const SUBSCRIBE_SPOTS_RES: u32 = 2128;
    pub const UNSUBSCRIBE_SPOTS_REQ: u32 = 2129;
    pub const UNSUBSCRIBE_SPOTS_RES: u32 = 2130;
    pub const SPOT_EVENT: u32 = 2131;
    pub const SUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2135;
    pub const UNSUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2136;
    pub const GET_TRENDBARS_REQ: u32 = 2137;
    pub const GET_TRENDBARS_RES: u32 = 2138;
    pub const ERROR_RES: u32 = 2142;
}

/// Trendbar period identifiers (subset of ProtoOATrendbarPeriod).
pub mod period {
    pub const M1: u32 = 1;
    pub const D1: u32 = 12;
}

/// Integer price scale: wire prices are `price * 100000`.
pub const PRICE_SCALE: f64 = 100_000.0;

/// JSON envelope carried inside each length-prefixed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub payload_type: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn event(payload_type: u32, payload: Value) -> Self {
        Self {
            payload_type,
            client_msg_id: None,
            payload,
        }
    }

    pub fn request(payload_type: u32, client_msg_id: String, payload: Value) -> Self {
        Self {
            payload_type,
            client_msg_id: Some(client_msg_id),
            payload,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Error response payload (`ERROR_RES`, also used inside auth failures).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error_code: String,
    #[serde(default)]
    pub description: String,
}

/// Light symbol entry from the catalog listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightSymbol {
    pub symbol_id: i64,
    pub symbol_name: String,
}

/// Symbols list response payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolsListPayload {
    #[serde(default)]
    pub symbol: Vec<LightSymbol>,
}

/// Full symbol details from `SYMBOL_BY_ID_RES`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolDetails {
    pub symbol_id: i64,
    pub digits: i32,
    pub pip_position: i32,
}

/// Symbol-by-id response payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolByIdPayload {
    #[serde(default)]
    pub symbol: Vec<SymbolDetails>,
}

/// Trendbar in relative integer encoding.
///
/// `low` is the absolute scaled low; open/high/close are deltas above
/// it. Timestamp is minutes since the UTC epoch.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTrendbar {
    pub low: i64,
    #[serde(default)]
    pub delta_open: i64,
    #[serde(default)]
    pub delta_high: i64,
    #[serde(default)]
    pub delta_close: i64,
    pub utc_timestamp_in_minutes: i64,
}

impl WireTrendbar {
    pub fn timestamp_ms(&self) -> i64 {
        self.utc_timestamp_in_minutes * 60_000
    }
}

/// Trendbar history response payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendbarsPayload {
    #[serde(default)]
    pub trendbar: Vec<WireTrendbar>,
}

/// Spot event payload: either a bid/ask quote, live trendbars, or both.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotEventPayload {
    pub symbol_id: i64,
    #[serde(default)]
    pub bid: Option<i64>,
    #[serde(default)]
    pub ask: Option<i64>,
    #[serde(default)]
    pub trendbar: Vec<WireTrendbar>,
}

/// Scale an integer wire price to a float rounded to `digits` decimals.
pub fn scale_price(raw: i64, digits: i32) -> f64 {
    round_to(raw as f64 / PRICE_SCALE, digits)
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}
