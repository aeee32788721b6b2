//! Tick codec: normalization at the upstream boundary and the two storage
//! encodings.
//!
//! Everything downstream of this module deals exclusively in
//! [`crate::models::TickRecord`]; the raw upstream callback shape and both
//! on-disk encodings exist only here.

pub mod binary;
pub mod json_lines;
pub mod tick;

pub use tick::{encode, request_id, TickFields, UpstreamTimestamp};

use crate::models::TickRecord;
use crate::storage::StorageFormat;

/// Decode one stored record in the given format.
///
/// For `JsonLines` the input is a single line without the trailing newline;
/// for `Binary` it is one frame payload (the bytes after the length prefix).
pub fn decode(bytes: &[u8], format: StorageFormat) -> std::io::Result<TickRecord> {
    match format {
        StorageFormat::JsonLines => json_lines::decode_line(bytes),
        StorageFormat::Binary => binary::decode_tick(bytes),
    }
}
