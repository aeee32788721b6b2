//! Upstream-to-canonical tick normalization.

use crate::error::ServiceError;
use crate::models::{now_us, TickRecord, TickType};

/// Timestamp as delivered by the upstream feed. Tick-by-tick messages carry
/// unix seconds; some historical endpoints already deliver microseconds.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamTimestamp {
    Seconds(i64),
    Micros(i64),
}

impl UpstreamTimestamp {
    pub fn as_micros(self) -> i64 {
        match self {
            Self::Seconds(s) => s * 1_000_000,
            Self::Micros(us) => us,
        }
    }
}

/// Raw field bundle from one upstream tick callback, before normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickFields {
    pub event_ts: Option<UpstreamTimestamp>,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub bid_price: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_price: Option<f64>,
    pub ask_size: Option<f64>,
    pub mid_price: Option<f64>,
    pub bid_past_low: bool,
    pub ask_past_high: bool,
    pub unreported: bool,
}

/// Deterministic 31-bit request id for a `(contract, tick type, creation
/// time)` triple.
///
/// The same id is handed to the gateway, logged there, and stored in every
/// record of the stream, so an operator can grep both sides with one value.
pub fn request_id(contract_id: i32, tick_type: TickType, sys_ts_us: i64) -> i32 {
    let digest = md5::compute(format!("{}_{}_{}", contract_id, tick_type, sys_ts_us));
    let word = i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (i64::from(word).unsigned_abs() % (1 << 31)) as i32
}

/// Normalize one upstream callback into a canonical record.
///
/// Aliases are folded before anything else, so no storage partition or
/// stream handle for an alias label can exist. A missing upstream timestamp
/// falls back to the local clock rather than being dropped.
pub fn encode(
    contract_id: i32,
    tick_type_label: &str,
    fields: TickFields,
) -> Result<TickRecord, ServiceError> {
    let tick_type = TickType::from_label(tick_type_label)?;
    let sys_ts_us = now_us();
    let event_ts_us = fields
        .event_ts
        .map(UpstreamTimestamp::as_micros)
        .unwrap_or(sys_ts_us);

    Ok(TickRecord {
        event_ts_us,
        sys_ts_us,
        contract_id,
        tick_type,
        request_id: request_id(contract_id, tick_type, sys_ts_us),
        price: fields.price,
        size: fields.size,
        bid_price: fields.bid_price,
        bid_size: fields.bid_size,
        ask_price: fields.ask_price,
        ask_size: fields.ask_size,
        mid_price: fields.mid_price,
        bid_past_low: fields.bid_past_low,
        ask_past_high: fields.ask_past_high,
        unreported: fields.unreported,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_deterministic() {
        let a = request_id(711280073, TickType::Last, 1_700_000_000_000_000);
        let b = request_id(711280073, TickType::Last, 1_700_000_000_000_000);
        assert_eq!(a, b);
        assert!(a >= 0);
    }

    #[test]
    fn request_id_varies_by_inputs() {
        let base = request_id(711280073, TickType::Last, 1_700_000_000_000_000);
        assert_ne!(
            base,
            request_id(711280074, TickType::Last, 1_700_000_000_000_000)
        );
        assert_ne!(
            base,
            request_id(711280073, TickType::BidAsk, 1_700_000_000_000_000)
        );
        assert_ne!(
            base,
            request_id(711280073, TickType::Last, 1_700_000_000_000_001)
        );
    }

    #[test]
    fn alias_encodes_as_last() {
        let rec = encode(
            711280073,
            "time_sales",
            TickFields {
                event_ts: Some(UpstreamTimestamp::Seconds(1_700_000_000)),
                price: Some(100.0),
                size: Some(5.0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rec.tick_type, TickType::Last);
        assert_eq!(rec.event_ts_us, 1_700_000_000_000_000);
        assert_eq!(rec.price, Some(100.0));
    }

    #[test]
    fn unknown_label_fails() {
        let err = encode(1, "greeks", TickFields::default()).unwrap_err();
        assert!(matches!(err, ServiceError::UnknownTickType(_)));
    }

    #[test]
    fn missing_event_ts_falls_back_to_sys_clock() {
        let rec = encode(1, "bid_ask", TickFields::default()).unwrap();
        assert_eq!(rec.event_ts_us, rec.sys_ts_us);
    }
}
