//! JSON-Lines storage encoding.
//!
//! One record per line with short mnemonic keys; unset fields and
//! default-false booleans are omitted entirely, which roughly halves the
//! on-disk volume versus the verbose field names.

use std::io;

use serde::{Deserialize, Serialize};

use crate::models::{TickRecord, TickType};

/// Wire shape of one stored line. Kept separate from [`TickRecord`] so the
/// storage key mnemonics never leak into the rest of the service.
#[derive(Debug, Serialize, Deserialize)]
struct JsonTick {
    ts: i64,
    st: i64,
    cid: i32,
    tt: TickType,
    rid: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ap: Option<f64>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    asz: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mp: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    bpl: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    aph: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    upt: bool,
}

impl From<&TickRecord> for JsonTick {
    fn from(r: &TickRecord) -> Self {
        Self {
            ts: r.event_ts_us,
            st: r.sys_ts_us,
            cid: r.contract_id,
            tt: r.tick_type,
            rid: r.request_id,
            p: r.price,
            s: r.size,
            bp: r.bid_price,
            bs: r.bid_size,
            ap: r.ask_price,
            asz: r.ask_size,
            mp: r.mid_price,
            bpl: r.bid_past_low,
            aph: r.ask_past_high,
            upt: r.unreported,
        }
    }
}

impl From<JsonTick> for TickRecord {
    fn from(j: JsonTick) -> Self {
        Self {
            event_ts_us: j.ts,
            sys_ts_us: j.st,
            contract_id: j.cid,
            tick_type: j.tt,
            request_id: j.rid,
            price: j.p,
            size: j.s,
            bid_price: j.bp,
            bid_size: j.bs,
            ask_price: j.ap,
            ask_size: j.asz,
            mid_price: j.mp,
            bid_past_low: j.bpl,
            ask_past_high: j.aph,
            unreported: j.upt,
        }
    }
}

/// Serialize one record to a line, without the trailing newline.
pub fn encode_line(record: &TickRecord) -> io::Result<Vec<u8>> {
    serde_json::to_vec(&JsonTick::from(record)).map_err(io::Error::from)
}

/// Parse one line (trailing newline tolerated) back into a record.
pub fn decode_line(line: &[u8]) -> io::Result<TickRecord> {
    let tick: JsonTick = serde_json::from_slice(line)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(tick.into())
}
