//! Canonical tick data model.
//!
//! Every tick that enters the service is normalized into a [`TickRecord`]
//! exactly once, at the upstream boundary. Records are immutable after
//! creation: storage, fan-out, and the historical buffer all share the same
//! value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Microseconds per UTC hour, the storage partition width.
pub const HOUR_US: i64 = 3_600_000_000;

/// The kinds of tick events the service understands.
///
/// Upstream aliases (`time_sales`) are folded into the canonical set before
/// anything downstream sees them, so a partition for an alias never exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickType {
    Last,
    AllLast,
    BidAsk,
    MidPoint,
}

impl TickType {
    /// All canonical tick types, in a stable order.
    pub const ALL: [TickType; 4] = [
        TickType::Last,
        TickType::AllLast,
        TickType::BidAsk,
        TickType::MidPoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::AllLast => "all_last",
            Self::BidAsk => "bid_ask",
            Self::MidPoint => "mid_point",
        }
    }

    /// Parse a label, folding upstream aliases into the canonical set.
    pub fn from_label(label: &str) -> Result<Self, ServiceError> {
        match label {
            "last" | "time_sales" => Ok(Self::Last),
            "all_last" => Ok(Self::AllLast),
            "bid_ask" => Ok(Self::BidAsk),
            "mid_point" | "midpoint" => Ok(Self::MidPoint),
            other => Err(ServiceError::UnknownTickType(other.to_string())),
        }
    }

    /// Stable numeric tag used by the binary storage format.
    pub fn wire_tag(&self) -> u8 {
        match self {
            Self::Last => 0,
            Self::AllLast => 1,
            Self::BidAsk => 2,
            Self::MidPoint => 3,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Last),
            1 => Some(Self::AllLast),
            2 => Some(Self::BidAsk),
            3 => Some(Self::MidPoint),
            _ => None,
        }
    }
}

impl fmt::Display for TickType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TickType {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s)
    }
}

/// Identity of a logical stream: one `(contract, tick type)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub contract_id: i32,
    pub tick_type: TickType,
}

impl StreamKey {
    pub fn new(contract_id: i32, tick_type: TickType) -> Self {
        Self {
            contract_id,
            tick_type,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.contract_id, self.tick_type)
    }
}

/// One market-data event, written once and never mutated.
///
/// `event_ts_us` is upstream-authoritative and drives every ordering,
/// rotation, and query decision. `sys_ts_us` is the local wall clock at
/// record creation and exists only to observe drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub event_ts_us: i64,
    pub sys_ts_us: i64,
    pub contract_id: i32,
    pub tick_type: TickType,
    pub request_id: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid_price: Option<f64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bid_past_low: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ask_past_high: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreported: bool,
}

impl TickRecord {
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.contract_id, self.tick_type)
    }

    /// Start of the UTC-hour window this record belongs to.
    pub fn hour_bucket_us(&self) -> i64 {
        hour_bucket(self.event_ts_us)
    }
}

/// Hour-align a microsecond timestamp.
pub fn hour_bucket(ts_us: i64) -> i64 {
    ts_us - ts_us.rem_euclid(HOUR_US)
}

/// Current wall clock in microseconds since the epoch.
pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_folds_to_last() {
        assert_eq!(TickType::from_label("time_sales").unwrap(), TickType::Last);
        assert_eq!(TickType::from_label("last").unwrap(), TickType::Last);
    }

    #[test]
    fn unknown_label_rejected() {
        let err = TickType::from_label("depth").unwrap_err();
        assert!(matches!(err, ServiceError::UnknownTickType(_)));
    }

    #[test]
    fn hour_bucket_aligns_down() {
        // 2001-09-09T01:46:40Z
        let ts = 1_000_000_000_000_000i64;
        let bucket = hour_bucket(ts);
        assert_eq!(bucket % HOUR_US, 0);
        assert!(bucket <= ts && ts - bucket < HOUR_US);

        // Exact boundary maps to itself.
        assert_eq!(hour_bucket(bucket), bucket);
    }

    #[test]
    fn serde_omits_absent_fields() {
        let rec = TickRecord {
            event_ts_us: 1,
            sys_ts_us: 2,
            contract_id: 3,
            tick_type: TickType::Last,
            request_id: 4,
            price: Some(101.5),
            size: Some(2.0),
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            mid_price: None,
            bid_past_low: false,
            ask_past_high: false,
            unreported: false,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("bid_price"));
        assert!(!json.contains("unreported"));

        let back: TickRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
