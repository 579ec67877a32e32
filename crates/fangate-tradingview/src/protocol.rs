//! TradingView websocket message language.
//!
//! Text frames carry one or more packets of the form
//! `~m~<byte-length>~m~<payload>`. Payloads are either JSON command
//! objects `{"m": method, "p": params}` or heartbeat tokens `~h~<n>`
//! that must be echoed back verbatim.

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Daily series identifier (first chart session).
pub const SERIES_D1: &str = "sds_1";
/// One-minute series identifier (second chart session).
pub const SERIES_M1: &str = "sds_2";

/// Wrap a payload string in the `~m~` length framing.
pub fn frame_packet(payload: &str) -> String {
    format!("~m~{}~m~{}", payload.len(), payload)
}

/// Build a framed command packet: `{"m": method, "p": params}`.
pub fn command(method: &str, params: Vec<Value>) -> String {
    let body = json!({ "m": method, "p": params });
    frame_packet(&body.to_string())
}

/// Split a text frame into its packet payloads.
///
/// Stops at the first malformed marker; a partial trailing packet is
/// dropped (the upstream sends whole packets per frame).
pub fn split_packets(input: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = input;
    while let Some(stripped) = rest.strip_prefix("~m~") {
        let Some(len_end) = stripped.find("~m~") else { break };
        let Ok(len) = stripped[..len_end].parse::<usize>() else {
            break;
        };
        let body = &stripped[len_end + 3..];
        let Some(payload) = body.get(..len) else { break };
        out.push(payload);
        rest = &body[len..];
    }
    out
}

/// Heartbeat payloads look like `~h~17`; the number is echoed back.
pub fn is_heartbeat(payload: &str) -> bool {
    payload.starts_with("~h~")
}

/// Generate a chart-session id: `<prefix>_<12 alnum chars>`.
pub fn generate_session_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..12])
}

/// Inbound command message.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartMessage {
    pub m: String,
    #[serde(default)]
    pub p: Vec<Value>,
}

impl ChartMessage {
    /// First positional param as a string (usually the chart-session id).
    pub fn session_param(&self) -> Option<&str> {
        self.p.first().and_then(|v| v.as_str())
    }
}

/// A bar row from `timescale_update`/`du`: `{"i": idx, "v": [ts, o, h, l, c, ...]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesRow {
    #[serde(default)]
    pub i: i64,
    pub v: Vec<f64>,
}

/// Extract series rows for a series id from an update's data object.
pub fn series_rows(data: &Value, series_id: &str) -> Vec<SeriesRow> {
    data.get(series_id)
        .and_then(|s| s.get("s"))
        .and_then(|rows| serde_json::from_value(rows.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_and_split_roundtrip() {
        let a = frame_packet("{\"m\":\"du\"}");
        let b = frame_packet("~h~3");
        let combined = format!("{a}{b}");
        let packets = split_packets(&combined);
        assert_eq!(packets, vec!["{\"m\":\"du\"}", "~h~3"]);
    }

    #[test]
    fn test_split_single_heartbeat() {
        let packets = split_packets("~m~4~m~~h~7");
        assert_eq!(packets, vec!["~h~7"]);
        assert!(is_heartbeat(packets[0]));
    }

    #[test]
    fn test_split_malformed_stops() {
        assert!(split_packets("garbage").is_empty());
        assert!(split_packets("~m~999~m~short").is_empty());
    }

    #[test]
    fn test_command_is_framed_json() {
        let pkt = command("chart_create_session", vec![serde_json::json!("cs_abc")]);
        assert!(pkt.starts_with("~m~"));
        let payloads = split_packets(&pkt);
        assert_eq!(payloads.len(), 1);
        let msg: ChartMessage = serde_json::from_str(payloads[0]).unwrap();
        assert_eq!(msg.m, "chart_create_session");
        assert_eq!(msg.session_param(), Some("cs_abc"));
    }

    #[test]
    fn test_session_id_shape() {
        let id = generate_session_id("cs");
        assert!(id.starts_with("cs_"));
        assert_eq!(id.len(), 15);
        assert_ne!(id, generate_session_id("cs"));
    }

    #[test]
    fn test_series_rows_extraction() {
        let data = serde_json::json!({
            "sds_1": { "s": [
                { "i": 0, "v": [1700000000.0, 1.08, 1.09, 1.07, 1.085, 1200.0] },
                { "i": 1, "v": [1700086400.0, 1.085, 1.10, 1.08, 1.09] }
            ]}
        });
        let rows = series_rows(&data, SERIES_D1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].v[4], 1.09);
        assert!(series_rows(&data, SERIES_M1).is_empty());
    }
}
