//! Length-prefixed binary storage encoding.
//!
//! File layout: one header frame describing the partition, then a stream of
//! tick frames. Every frame is `[u32 big-endian payload length][payload]`;
//! all integers inside payloads are big-endian. Optional fields are encoded
//! by presence bits rather than sentinel values, which is where the ~35%
//! size win over the JSON-Lines form comes from.

use std::io::{self, Read, Write};

use crate::models::{TickRecord, TickType};

/// Encoding version written into every file header.
pub const FORMAT_VERSION: u8 = 1;
/// Format discriminator for the length-prefixed tick encoding.
pub const FORMAT_ID: u8 = 0x54; // 'T'

/// Frames larger than this are treated as corruption, not data.
const MAX_FRAME_LEN: u32 = 1 << 20;

const PRESENT_PRICE: u8 = 0x01;
const PRESENT_SIZE: u8 = 0x02;
const PRESENT_BID_PRICE: u8 = 0x04;
const PRESENT_BID_SIZE: u8 = 0x08;
const PRESENT_ASK_PRICE: u8 = 0x10;
const PRESENT_ASK_SIZE: u8 = 0x20;
const PRESENT_MID_PRICE: u8 = 0x40;

const FLAG_BID_PAST_LOW: u8 = 0x01;
const FLAG_ASK_PAST_HIGH: u8 = 0x02;
const FLAG_UNREPORTED: u8 = 0x04;

/// First framed record of every binary partition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u8,
    pub contract_id: i32,
    pub tick_type: TickType,
    pub hour_bucket_us: i64,
}

impl FileHeader {
    pub fn new(contract_id: i32, tick_type: TickType, hour_bucket_us: i64) -> Self {
        Self {
            version: FORMAT_VERSION,
            contract_id,
            tick_type,
            hour_bucket_us,
        }
    }
}

pub fn encode_header(header: &FileHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(15);
    buf.push(header.version);
    buf.push(FORMAT_ID);
    buf.extend_from_slice(&header.contract_id.to_be_bytes());
    buf.push(header.tick_type.wire_tag());
    buf.extend_from_slice(&header.hour_bucket_us.to_be_bytes());
    buf
}

pub fn decode_header(payload: &[u8]) -> io::Result<FileHeader> {
    if payload.len() != 15 {
        return Err(corrupt("bad header length"));
    }
    if payload[1] != FORMAT_ID {
        return Err(corrupt("unexpected format id"));
    }
    let tick_type = TickType::from_wire_tag(payload[6]).ok_or_else(|| corrupt("bad tick type"))?;
    Ok(FileHeader {
        version: payload[0],
        contract_id: i32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]),
        tick_type,
        hour_bucket_us: read_i64(payload, 7)?,
    })
}

pub fn encode_tick(record: &TickRecord) -> Vec<u8> {
    let mut present = 0u8;
    let optionals = [
        (record.price, PRESENT_PRICE),
        (record.size, PRESENT_SIZE),
        (record.bid_price, PRESENT_BID_PRICE),
        (record.bid_size, PRESENT_BID_SIZE),
        (record.ask_price, PRESENT_ASK_PRICE),
        (record.ask_size, PRESENT_ASK_SIZE),
        (record.mid_price, PRESENT_MID_PRICE),
    ];
    for (value, bit) in optionals {
        if value.is_some() {
            present |= bit;
        }
    }

    let mut flags = 0u8;
    if record.bid_past_low {
        flags |= FLAG_BID_PAST_LOW;
    }
    if record.ask_past_high {
        flags |= FLAG_ASK_PAST_HIGH;
    }
    if record.unreported {
        flags |= FLAG_UNREPORTED;
    }

    let mut buf = Vec::with_capacity(27 + 8 * present.count_ones() as usize);
    buf.push(present);
    buf.push(flags);
    buf.extend_from_slice(&record.event_ts_us.to_be_bytes());
    buf.extend_from_slice(&record.sys_ts_us.to_be_bytes());
    buf.extend_from_slice(&record.contract_id.to_be_bytes());
    buf.push(record.tick_type.wire_tag());
    buf.extend_from_slice(&record.request_id.to_be_bytes());
    for (value, _) in optionals {
        if let Some(v) = value {
            buf.extend_from_slice(&v.to_be_bytes());
        }
    }
    buf
}

pub fn decode_tick(payload: &[u8]) -> io::Result<TickRecord> {
    if payload.len() < 27 {
        return Err(corrupt("tick frame too short"));
    }
    let present = payload[0];
    let flags = payload[1];
    let event_ts_us = read_i64(payload, 2)?;
    let sys_ts_us = read_i64(payload, 10)?;
    let contract_id = read_i32(payload, 18)?;
    let tick_type =
        TickType::from_wire_tag(payload[22]).ok_or_else(|| corrupt("bad tick type"))?;
    let request_id = read_i32(payload, 23)?;

    let expected = 27 + 8 * present.count_ones() as usize;
    if payload.len() != expected {
        return Err(corrupt("tick frame length does not match presence bits"));
    }

    let mut cursor = 27usize;
    let mut take = |bit: u8| -> Option<f64> {
        if present & bit != 0 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&payload[cursor..cursor + 8]);
            cursor += 8;
            Some(f64::from_be_bytes(bytes))
        } else {
            None
        }
    };

    Ok(TickRecord {
        event_ts_us,
        sys_ts_us,
        contract_id,
        tick_type,
        request_id,
        price: take(PRESENT_PRICE),
        size: take(PRESENT_SIZE),
        bid_price: take(PRESENT_BID_PRICE),
        bid_size: take(PRESENT_BID_SIZE),
        ask_price: take(PRESENT_ASK_PRICE),
        ask_size: take(PRESENT_ASK_SIZE),
        mid_price: take(PRESENT_MID_PRICE),
        bid_past_low: flags & FLAG_BID_PAST_LOW != 0,
        ask_past_high: flags & FLAG_ASK_PAST_HIGH != 0,
        unreported: flags & FLAG_UNREPORTED != 0,
    })
}

/// Write one `[len][payload]` frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)
}

/// Read the next frame payload, or `None` at a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(corrupt("frame length exceeds cap"));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn corrupt(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn read_i64(payload: &[u8], at: usize) -> io::Result<i64> {
    let bytes: [u8; 8] = payload
        .get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| corrupt("truncated integer field"))?;
    Ok(i64::from_be_bytes(bytes))
}

fn read_i32(payload: &[u8], at: usize) -> io::Result<i32> {
    let bytes: [u8; 4] = payload
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| corrupt("truncated integer field"))?;
    Ok(i32::from_be_bytes(bytes))
}
