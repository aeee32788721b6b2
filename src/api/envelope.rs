//! Unified downstream message envelope.
//!
//! Both transports serialize the same envelope; only framing differs. The
//! `stream_id` names one subscriber's view of a stream and is minted per
//! subscription, so errors and completions can be routed to one subscriber
//! without touching others sharing the upstream stream.

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::{StreamKey, TickRecord};

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub stream_id: String,
    /// ISO-8601 UTC with millisecond precision.
    pub timestamp: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Envelope {
    fn new(msg_type: &'static str, stream_id: &str, data: Value, metadata: Option<Value>) -> Self {
        Self {
            msg_type,
            stream_id: stream_id.to_string(),
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            data,
            metadata,
        }
    }

    pub fn tick(stream_id: &str, record: &TickRecord, historical: bool) -> Self {
        let data = serde_json::to_value(record).unwrap_or_else(|_| json!({}));
        Self::new(
            "tick",
            stream_id,
            data,
            Some(json!({ "historical": historical })),
        )
    }

    pub fn error(stream_id: &str, code: &str, message: &str, recoverable: bool) -> Self {
        Self::new(
            "error",
            stream_id,
            json!({ "code": code, "message": message, "recoverable": recoverable }),
            None,
        )
    }

    pub fn complete(stream_id: &str, reason: &str, total_ticks: u64) -> Self {
        Self::new(
            "complete",
            stream_id,
            json!({ "reason": reason, "total_ticks": total_ticks }),
            None,
        )
    }

    pub fn info(stream_id: &str, status: &str, extra: Value) -> Self {
        Self::new("info", stream_id, json!({ "status": status, "detail": extra }), None)
    }

    /// Connection-level hello for the WebSocket transport.
    pub fn connected(capabilities: Value) -> Self {
        Self::new("connected", "", json!({ "capabilities": capabilities }), None)
    }

    pub fn pong(echo: Value) -> Self {
        Self::new("pong", "", echo, None)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Mint a subscriber-scoped stream id:
/// `<contract>_<tick_type>_<creation_ms>_<rand>`.
pub fn new_stream_id(key: StreamKey) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0x1000..0xFFFF);
    format!(
        "{}_{}_{}_{:x}",
        key.contract_id,
        key.tick_type,
        Utc::now().timestamp_millis(),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickType;

    #[test]
    fn stream_ids_are_unique_and_structured() {
        let key = StreamKey::new(42, TickType::BidAsk);
        let a = new_stream_id(key);
        let b = new_stream_id(key);
        assert!(a.starts_with("42_bid_ask_"));
        assert_ne!(a, b);
    }

    #[test]
    fn tick_envelope_carries_historical_flag() {
        let record = TickRecord {
            event_ts_us: 1,
            sys_ts_us: 1,
            contract_id: 42,
            tick_type: TickType::Last,
            request_id: 7,
            price: Some(10.0),
            size: Some(1.0),
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            mid_price: None,
            bid_past_low: false,
            ask_past_high: false,
            unreported: false,
        };
        let envelope = Envelope::tick("s1", &record, true);
        let value: Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(value["type"], "tick");
        assert_eq!(value["stream_id"], "s1");
        assert_eq!(value["metadata"]["historical"], true);
        assert_eq!(value["data"]["price"], 10.0);
        // Millisecond-precision UTC timestamp.
        let ts = value["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z') && ts.contains('.'));
    }
}
