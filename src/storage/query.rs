//! Buffer-query engine.
//!
//! Answers range queries by stitching three sources: sealed hourly files,
//! the open current-hour file (read up to a position captured at scan
//! start), and the multiplexer's live tail ring. Results are merged into
//! `event_ts_us` order with ties resolved files-first.

use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::codec::{binary, json_lines};
use crate::error::ServiceError;
use crate::models::{StreamKey, TickRecord, TickType};
use crate::storage::index::{FileState, IndexEntry, PartitionIndex};
use crate::storage::sessions::MarketSession;
use crate::storage::StorageFormat;

/// A requested time window, before resolution against the clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeRange {
    /// `[start_us, end_us]`, both inclusive.
    Explicit { start_us: i64, end_us: i64 },
    /// `[start_us, now]`.
    Since { start_us: i64 },
    /// `[now - window, now]`, e.g. `last_15m`.
    Trailing(Duration),
    /// The most recent occurrence of a named session, whole window.
    Session(MarketSession),
    /// From the most recent session open up to now.
    SessionOpenToNow(MarketSession),
}

impl TimeRange {
    pub fn last_hours(hours: u64) -> Self {
        Self::Trailing(Duration::from_secs(hours * 3600))
    }

    /// Resolve to concrete `[start_us, end_us]` bounds.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<(i64, i64), ServiceError> {
        let now_us = now.timestamp_micros();
        let (start, end) = match self {
            Self::Explicit { start_us, end_us } => (*start_us, *end_us),
            Self::Since { start_us } => (*start_us, now_us),
            Self::Trailing(window) => (now_us - window.as_micros() as i64, now_us),
            Self::Session(session) => session.window_ending_at(now)?,
            Self::SessionOpenToNow(session) => {
                let (open, _) = session.window_ending_at(now)?;
                (open, now_us)
            }
        };
        if start > end {
            return Err(ServiceError::InvalidRange(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok((start, end))
    }
}

impl FromStr for TimeRange {
    type Err = ServiceError;

    /// Parse the named forms used on the HTTP surface: `last_15m`,
    /// `last_1h`, `session_open..now`, or a bare session name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("last_") {
            let (digits, unit) = rest.split_at(rest.len().saturating_sub(1));
            let value: u64 = digits
                .parse()
                .map_err(|_| ServiceError::InvalidRange(format!("bad window: {s}")))?;
            let secs = match unit {
                "s" => value,
                "m" => value * 60,
                "h" => value * 3600,
                _ => return Err(ServiceError::InvalidRange(format!("bad window unit: {s}"))),
            };
            return Ok(Self::Trailing(Duration::from_secs(secs)));
        }
        if let Some(session) = s.strip_suffix("..now") {
            let session = session.strip_suffix("_open").unwrap_or(session);
            let session = if session == "session" {
                MarketSession::UsRegular
            } else {
                session.parse()?
            };
            return Ok(Self::SessionOpenToNow(session));
        }
        Ok(Self::Session(s.parse()?))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    /// Also read the partition currently being appended to.
    pub include_open_file: bool,
    /// Drain the live tail ring for records newer than the files held.
    pub include_tail: bool,
    /// Cap on returned records, applied after merging.
    pub limit: Option<usize>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            include_open_file: true,
            include_tail: false,
            limit: None,
        }
    }
}

/// Live-tail access, implemented by the stream multiplexer. A trait seam so
/// storage does not depend on the streaming layer.
pub trait TailSource: Send + Sync {
    fn tail(&self, key: StreamKey) -> Vec<TickRecord>;
}

pub struct BufferQuery {
    index: Arc<PartitionIndex>,
    /// Enabled formats in read-preference order; the first format holding a
    /// partition wins, the other is redundant by construction.
    formats: Vec<StorageFormat>,
    tail: parking_lot::RwLock<Option<Arc<dyn TailSource>>>,
}

impl BufferQuery {
    pub fn new(index: Arc<PartitionIndex>, formats: Vec<StorageFormat>) -> Self {
        Self {
            index,
            formats,
            tail: parking_lot::RwLock::new(None),
        }
    }

    /// Attach the live tail source once the multiplexer exists.
    pub fn set_tail_source(&self, tail: Arc<dyn TailSource>) {
        *self.tail.write() = Some(tail);
    }

    /// Range query over one contract. Returns records in `event_ts_us`
    /// order; ties keep file records ahead of tail records.
    pub fn query(
        &self,
        contract_id: i32,
        tick_types: &[TickType],
        range: TimeRange,
        options: QueryOptions,
    ) -> Result<Vec<TickRecord>, ServiceError> {
        if contract_id <= 0 {
            return Err(ServiceError::InvalidContract(contract_id.to_string()));
        }
        if tick_types.is_empty() {
            return Err(ServiceError::InvalidRange(
                "at least one tick type is required".to_string(),
            ));
        }
        let (start_us, end_us) = range.resolve(Utc::now())?;

        let mut out = Vec::new();
        for tick_type in tick_types {
            let key = StreamKey::new(contract_id, *tick_type);
            let mut newest_from_files = i64::MIN;

            let entries = self.entries_for(key, start_us, end_us, options.include_open_file);
            for entry in &entries {
                let records = read_entry(entry, start_us, end_us);
                if let Some(last) = records.last() {
                    newest_from_files = newest_from_files.max(last.event_ts_us);
                }
                out.extend(records);
            }

            if options.include_tail {
                if let Some(tail) = self.tail.read().clone() {
                    for rec in tail.tail(key) {
                        if rec.event_ts_us > newest_from_files
                            && rec.event_ts_us >= start_us
                            && rec.event_ts_us <= end_us
                        {
                            out.push(rec);
                        }
                    }
                }
            }
        }

        // Stable sort keeps source order (files, then tail) on equal
        // timestamps.
        out.sort_by_key(|r| r.event_ts_us);
        if let Some(limit) = options.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Index entries to read for one key, picking the first enabled format
    /// that holds each hour so the redundant format is not double-read.
    fn entries_for(
        &self,
        key: StreamKey,
        start_us: i64,
        end_us: i64,
        include_open: bool,
    ) -> Vec<IndexEntry> {
        let mut chosen: Vec<IndexEntry> = Vec::new();
        for format in &self.formats {
            let entries = self.index.intersecting(
                key.contract_id,
                &[key.tick_type],
                *format,
                start_us,
                end_us,
                include_open,
            );
            for entry in entries {
                if !chosen
                    .iter()
                    .any(|e| e.hour_bucket_us == entry.hour_bucket_us)
                {
                    chosen.push(entry);
                }
            }
        }
        chosen.sort_by_key(|e| e.hour_bucket_us);
        chosen
    }
}

/// Read one partition file, filtered to `[start_us, end_us]`.
///
/// Only bytes up to the length captured at open are consumed, so a file
/// that is concurrently appended to yields a consistent prefix. Torn or
/// corrupt trailing data ends the scan instead of failing the query.
fn read_entry(entry: &IndexEntry, start_us: i64, end_us: i64) -> Vec<TickRecord> {
    match read_entry_inner(entry, start_us, end_us) {
        Ok(records) => records,
        Err(e) => {
            warn!(path = %entry.path.display(), error = %e, "failed to read partition file");
            Vec::new()
        }
    }
}

fn read_entry_inner(
    entry: &IndexEntry,
    start_us: i64,
    end_us: i64,
) -> std::io::Result<Vec<TickRecord>> {
    let file = std::fs::File::open(&entry.path)?;
    let captured_len = file.metadata()?.len();
    let mut reader = std::io::BufReader::new(file).take(captured_len);
    let mut out = Vec::new();

    match entry.format {
        StorageFormat::JsonLines => {
            let mut data = Vec::with_capacity(captured_len as usize);
            reader.read_to_end(&mut data)?;
            for line in data.split(|b| *b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                match json_lines::decode_line(line) {
                    Ok(rec) => {
                        if rec.event_ts_us >= start_us && rec.event_ts_us <= end_us {
                            out.push(rec);
                        }
                    }
                    Err(e) => {
                        // A partial final line is expected on the open file.
                        if entry.state == FileState::Open {
                            debug!(path = %entry.path.display(), "stopping at partial line");
                            break;
                        }
                        return Err(e);
                    }
                }
            }
        }
        StorageFormat::Binary => {
            let header = match binary::read_frame(&mut reader) {
                Ok(Some(payload)) => payload,
                Ok(None) => return Ok(out),
                Err(e) => return Err(e),
            };
            binary::decode_header(&header)?;
            loop {
                match binary::read_frame(&mut reader) {
                    Ok(Some(payload)) => {
                        let rec = binary::decode_tick(&payload)?;
                        if rec.event_ts_us >= start_us && rec.event_ts_us <= end_us {
                            out.push(rec);
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        // Torn frame at the flush boundary of an open file.
                        debug!(path = %entry.path.display(), "stopping at torn frame");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::writer::TickStore;
    use std::collections::HashMap;
    use tokio::sync::watch;

    fn tick(event_ts_us: i64) -> TickRecord {
        TickRecord {
            event_ts_us,
            sys_ts_us: event_ts_us,
            contract_id: 711280073,
            tick_type: TickType::Last,
            request_id: 9,
            price: Some(50.0),
            size: Some(1.0),
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            mid_price: None,
            bid_past_low: false,
            ask_past_high: false,
            unreported: false,
        }
    }

    struct FixedTail(HashMap<StreamKey, Vec<TickRecord>>);

    impl TailSource for FixedTail {
        fn tail(&self, key: StreamKey) -> Vec<TickRecord> {
            self.0.get(&key).cloned().unwrap_or_default()
        }
    }

    async fn populated(
        dir: &std::path::Path,
        events: &[i64],
    ) -> (Arc<PartitionIndex>, TickStore, watch::Sender<bool>) {
        let index = Arc::new(PartitionIndex::new());
        let (sd_tx, sd_rx) = watch::channel(false);
        let (store, _) = TickStore::spawn(
            dir.to_path_buf(),
            vec![StorageFormat::JsonLines, StorageFormat::Binary],
            index.clone(),
            1024,
            sd_rx,
        );
        for ts in events {
            store.record(tick(*ts));
        }
        store.flush().await;
        (index, store, sd_tx)
    }

    #[tokio::test]
    async fn boundary_filtering_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let t = 1_700_000_000_000_000i64;
        let (index, _store, _sd) = populated(dir.path(), &[t - 10, t - 5, t + 5, t + 10]).await;

        let query = BufferQuery::new(index, vec![StorageFormat::JsonLines]);
        let opts = QueryOptions::default();

        let recs = query
            .query(
                711280073,
                &[TickType::Last],
                TimeRange::Explicit {
                    start_us: t,
                    end_us: i64::MAX,
                },
                opts,
            )
            .unwrap();
        assert_eq!(
            recs.iter().map(|r| r.event_ts_us).collect::<Vec<_>>(),
            vec![t + 5, t + 10]
        );

        let recs = query
            .query(
                711280073,
                &[TickType::Last],
                TimeRange::Explicit {
                    start_us: t - 5,
                    end_us: t + 5,
                },
                opts,
            )
            .unwrap();
        assert_eq!(
            recs.iter().map(|r| r.event_ts_us).collect::<Vec<_>>(),
            vec![t - 5, t + 5]
        );
    }

    #[tokio::test]
    async fn formats_are_not_double_read() {
        let dir = tempfile::tempdir().unwrap();
        let t = 1_700_000_000_000_000i64;
        let (index, _store, _sd) = populated(dir.path(), &[t, t + 1, t + 2]).await;

        // Both formats enabled: each hour must be read from exactly one.
        let query = BufferQuery::new(
            index,
            vec![StorageFormat::JsonLines, StorageFormat::Binary],
        );
        let recs = query
            .query(
                711280073,
                &[TickType::Last],
                TimeRange::Explicit {
                    start_us: t,
                    end_us: t + 10,
                },
                QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(recs.len(), 3);
    }

    #[tokio::test]
    async fn tail_merges_strictly_newer_records() {
        let dir = tempfile::tempdir().unwrap();
        let t = 1_700_000_000_000_000i64;
        let (index, _store, _sd) = populated(dir.path(), &[t, t + 1_000]).await;

        let key = StreamKey::new(711280073, TickType::Last);
        let mut tails = HashMap::new();
        // Overlapping record at t+1_000 must be deduped; t+2_000 appended.
        tails.insert(key, vec![tick(t + 1_000), tick(t + 2_000)]);

        let query = BufferQuery::new(index, vec![StorageFormat::JsonLines]);
        query.set_tail_source(Arc::new(FixedTail(tails)));

        let recs = query
            .query(
                711280073,
                &[TickType::Last],
                TimeRange::Explicit {
                    start_us: t,
                    end_us: t + 10_000,
                },
                QueryOptions {
                    include_tail: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            recs.iter().map(|r| r.event_ts_us).collect::<Vec<_>>(),
            vec![t, t + 1_000, t + 2_000]
        );
    }

    #[test]
    fn named_windows_parse() {
        assert_eq!(
            "last_15m".parse::<TimeRange>().unwrap(),
            TimeRange::Trailing(Duration::from_secs(900))
        );
        assert_eq!(
            "last_1h".parse::<TimeRange>().unwrap(),
            TimeRange::Trailing(Duration::from_secs(3600))
        );
        assert!(matches!(
            "session_open..now".parse::<TimeRange>().unwrap(),
            TimeRange::SessionOpenToNow(MarketSession::UsRegular)
        ));
        assert!(matches!(
            "jp_regular".parse::<TimeRange>().unwrap(),
            TimeRange::Session(MarketSession::JpRegular)
        ));
        assert!("last_".parse::<TimeRange>().is_err());
    }

    #[test]
    fn inverted_range_rejected() {
        let r = TimeRange::Explicit {
            start_us: 10,
            end_us: 5,
        };
        assert!(matches!(
            r.resolve(Utc::now()),
            Err(ServiceError::InvalidRange(_))
        ));
    }
}
