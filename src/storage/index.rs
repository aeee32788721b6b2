//! File-partition index.
//!
//! Tracks every hourly partition file the service knows about, per
//! `(contract, tick type, format)`. The index is read-mostly (queries) with
//! short write bursts on append/rotation, so it sits behind a
//! reader-writer lock. It is rebuilt from a directory scan at startup; the
//! on-disk tree is the source of truth.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec;
use crate::models::{hour_bucket, now_us, StreamKey, TickType, HOUR_US};
use crate::storage::StorageFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Current hour, still receiving appends.
    Open,
    /// Past hour, immutable.
    Sealed,
    /// Last append failed; the writer reopens on the next record.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub contract_id: i32,
    pub tick_type: TickType,
    pub format: StorageFormat,
    pub path: PathBuf,
    pub hour_bucket_us: i64,
    pub first_event_ts_us: Option<i64>,
    pub last_event_ts_us: Option<i64>,
    pub record_count: u64,
    pub byte_count: u64,
    pub state: FileState,
}

impl IndexEntry {
    /// Effective timestamp span for intersection tests. An entry that has
    /// not recorded a tick yet covers just its hour window.
    fn span(&self) -> (i64, i64) {
        match (self.first_event_ts_us, self.last_event_ts_us) {
            (Some(first), Some(last)) => (first, last),
            _ => (self.hour_bucket_us, self.hour_bucket_us + HOUR_US - 1),
        }
    }
}

/// Aggregate view of one `(tick type, format)` partition family, served by
/// the buffer-info endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
    pub tick_type: TickType,
    pub format: StorageFormat,
    pub file_count: usize,
    pub record_count: u64,
    pub byte_count: u64,
    pub first_event_ts_us: Option<i64>,
    pub last_event_ts_us: Option<i64>,
    pub has_open_file: bool,
}

/// Build the canonical partition file path:
/// `{root}/{format}/{yyyy}/{mm}/{dd}/{hh}/{cid}_{tick_type}_{bucket_secs}.{ext}`.
pub fn partition_path(
    root: &Path,
    format: StorageFormat,
    key: StreamKey,
    hour_bucket_us: i64,
) -> PathBuf {
    let bucket_secs = hour_bucket_us / 1_000_000;
    let dt: DateTime<Utc> = DateTime::from_timestamp(bucket_secs, 0).unwrap_or_default();
    root.join(format.dir_name())
        .join(format!("{:04}", dt.year()))
        .join(format!("{:02}", dt.month()))
        .join(format!("{:02}", dt.day()))
        .join(format!("{:02}", dt.hour()))
        .join(format!(
            "{}_{}_{}.{}",
            key.contract_id,
            key.tick_type,
            bucket_secs,
            format.extension()
        ))
}

/// Parse `{cid}_{tick_type}_{bucket_secs}` out of a partition file stem.
fn parse_file_stem(stem: &str) -> Option<(i32, TickType, i64)> {
    // The tick type itself contains underscores, so split from both ends.
    let (cid_part, rest) = stem.split_once('_')?;
    let (tt_part, bucket_part) = rest.rsplit_once('_')?;
    let contract_id = cid_part.parse::<i32>().ok()?;
    let tick_type = TickType::from_label(tt_part).ok()?;
    let bucket_secs = bucket_part.parse::<i64>().ok()?;
    Some((contract_id, tick_type, bucket_secs * 1_000_000))
}

type PartitionMap = HashMap<(StreamKey, StorageFormat), Vec<IndexEntry>>;

#[derive(Default)]
pub struct PartitionIndex {
    partitions: RwLock<PartitionMap>,
}

impl PartitionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened partition file. Any other `open` entry for
    /// the same `(key, format)` is sealed first, preserving the at-most-one
    /// open invariant.
    pub fn ensure_open(
        &self,
        key: StreamKey,
        format: StorageFormat,
        path: &Path,
        hour_bucket_us: i64,
    ) {
        let mut partitions = self.partitions.write();
        let entries = partitions.entry((key, format)).or_default();
        for entry in entries.iter_mut() {
            if entry.state == FileState::Open && entry.hour_bucket_us != hour_bucket_us {
                entry.state = FileState::Sealed;
            }
        }
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.hour_bucket_us == hour_bucket_us)
        {
            existing.state = FileState::Open;
            return;
        }
        entries.push(IndexEntry {
            contract_id: key.contract_id,
            tick_type: key.tick_type,
            format,
            path: path.to_path_buf(),
            hour_bucket_us,
            first_event_ts_us: None,
            last_event_ts_us: None,
            record_count: 0,
            byte_count: 0,
            state: FileState::Open,
        });
        entries.sort_by_key(|e| e.hour_bucket_us);
    }

    /// Update counters after a successful append.
    pub fn record_append(
        &self,
        key: StreamKey,
        format: StorageFormat,
        hour_bucket_us: i64,
        event_ts_us: i64,
        bytes: u64,
    ) {
        let mut partitions = self.partitions.write();
        let Some(entry) = partitions
            .get_mut(&(key, format))
            .and_then(|v| v.iter_mut().find(|e| e.hour_bucket_us == hour_bucket_us))
        else {
            return;
        };
        entry.first_event_ts_us.get_or_insert(event_ts_us);
        entry.last_event_ts_us = Some(
            entry
                .last_event_ts_us
                .map_or(event_ts_us, |last| last.max(event_ts_us)),
        );
        entry.record_count += 1;
        entry.byte_count += bytes;
        entry.state = FileState::Open;
    }

    pub fn seal(&self, key: StreamKey, format: StorageFormat, hour_bucket_us: i64) {
        self.set_state(key, format, hour_bucket_us, FileState::Sealed);
    }

    pub fn mark_failed(&self, key: StreamKey, format: StorageFormat, hour_bucket_us: i64) {
        self.set_state(key, format, hour_bucket_us, FileState::Failed);
    }

    fn set_state(
        &self,
        key: StreamKey,
        format: StorageFormat,
        hour_bucket_us: i64,
        state: FileState,
    ) {
        let mut partitions = self.partitions.write();
        if let Some(entry) = partitions
            .get_mut(&(key, format))
            .and_then(|v| v.iter_mut().find(|e| e.hour_bucket_us == hour_bucket_us))
        {
            entry.state = state;
        }
    }

    /// Entries whose recorded span intersects `[start_us, end_us]`, for the
    /// given contract and tick types, ordered by (tick type, hour).
    pub fn intersecting(
        &self,
        contract_id: i32,
        tick_types: &[TickType],
        format: StorageFormat,
        start_us: i64,
        end_us: i64,
        include_open: bool,
    ) -> Vec<IndexEntry> {
        let partitions = self.partitions.read();
        let mut out = Vec::new();
        for tick_type in tick_types {
            let key = StreamKey::new(contract_id, *tick_type);
            if let Some(entries) = partitions.get(&(key, format)) {
                for entry in entries {
                    if entry.state == FileState::Failed {
                        continue;
                    }
                    if entry.state == FileState::Open && !include_open {
                        continue;
                    }
                    let (first, last) = entry.span();
                    if first <= end_us && last >= start_us {
                        out.push(entry.clone());
                    }
                }
            }
        }
        out
    }

    /// Per-(tick type, format) aggregates for one contract.
    pub fn stats(&self, contract_id: i32) -> Vec<PartitionStats> {
        let partitions = self.partitions.read();
        let mut out = Vec::new();
        for ((key, format), entries) in partitions.iter() {
            if key.contract_id != contract_id || entries.is_empty() {
                continue;
            }
            out.push(PartitionStats {
                tick_type: key.tick_type,
                format: *format,
                file_count: entries.len(),
                record_count: entries.iter().map(|e| e.record_count).sum(),
                byte_count: entries.iter().map(|e| e.byte_count).sum(),
                first_event_ts_us: entries.iter().filter_map(|e| e.first_event_ts_us).min(),
                last_event_ts_us: entries.iter().filter_map(|e| e.last_event_ts_us).max(),
                has_open_file: entries.iter().any(|e| e.state == FileState::Open),
            });
        }
        out.sort_by_key(|s| (s.tick_type.wire_tag(), s.format.dir_name()));
        out
    }

    /// All entries for a key in one format, ordered by hour.
    pub fn entries(&self, key: StreamKey, format: StorageFormat) -> Vec<IndexEntry> {
        self.partitions
            .read()
            .get(&(key, format))
            .cloned()
            .unwrap_or_default()
    }

    /// Rebuild the index by walking the storage tree. Files that do not
    /// match the partition naming convention are skipped with a debug log;
    /// unreadable files are skipped with a warning. Entries for past hours
    /// come back `sealed`, the current hour comes back `open`.
    pub fn rebuild_from_disk(&self, root: &Path, formats: &[StorageFormat]) -> io::Result<()> {
        let current_bucket = hour_bucket(now_us());
        for format in formats {
            let format_root = root.join(format.dir_name());
            if !format_root.exists() {
                continue;
            }
            let mut files = Vec::new();
            collect_files(&format_root, &mut files)?;
            for path in files {
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if path.extension().and_then(|e| e.to_str()) != Some(format.extension()) {
                    debug!(path = %path.display(), "skipping foreign file in storage tree");
                    continue;
                }
                let Some((contract_id, tick_type, bucket_us)) = parse_file_stem(stem) else {
                    debug!(path = %path.display(), "skipping unparseable partition name");
                    continue;
                };
                match scan_file(&path, *format) {
                    Ok((record_count, byte_count, first, last)) => {
                        let key = StreamKey::new(contract_id, tick_type);
                        let state = if bucket_us >= current_bucket {
                            FileState::Open
                        } else {
                            FileState::Sealed
                        };
                        let mut partitions = self.partitions.write();
                        let entries = partitions.entry((key, *format)).or_default();
                        entries.push(IndexEntry {
                            contract_id,
                            tick_type,
                            format: *format,
                            path: path.clone(),
                            hour_bucket_us: bucket_us,
                            first_event_ts_us: first,
                            last_event_ts_us: last,
                            record_count,
                            byte_count,
                            state,
                        });
                        entries.sort_by_key(|e| e.hour_bucket_us);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable partition file");
                    }
                }
            }
        }
        Ok(())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Read one partition file, returning `(records, bytes, first_ts, last_ts)`.
fn scan_file(
    path: &Path,
    format: StorageFormat,
) -> io::Result<(u64, u64, Option<i64>, Option<i64>)> {
    let byte_count = std::fs::metadata(path)?.len();
    let mut record_count = 0u64;
    let mut first = None;
    let mut last = None;

    match format {
        StorageFormat::JsonLines => {
            let data = std::fs::read(path)?;
            for line in data.split(|b| *b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                let rec = codec::json_lines::decode_line(line)?;
                record_count += 1;
                first.get_or_insert(rec.event_ts_us);
                last = Some(rec.event_ts_us);
            }
        }
        StorageFormat::Binary => {
            let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
            let Some(header) = codec::binary::read_frame(&mut reader)? else {
                return Ok((0, byte_count, None, None));
            };
            codec::binary::decode_header(&header)?;
            while let Some(frame) = codec::binary::read_frame(&mut reader)? {
                let rec = codec::binary::decode_tick(&frame)?;
                record_count += 1;
                first.get_or_insert(rec.event_ts_us);
                last = Some(rec.event_ts_us);
            }
        }
    }

    Ok((record_count, byte_count, first, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_layout_is_hour_partitioned() {
        // 2023-11-14T22:00:00Z
        let bucket = 1_700_000_000_000_000 - (1_700_000_000_000_000 % HOUR_US);
        let path = partition_path(
            Path::new("/data"),
            StorageFormat::JsonLines,
            StreamKey::new(711280073, TickType::BidAsk),
            bucket,
        );
        let text = path.to_string_lossy().replace('\\', "/");
        assert!(text.starts_with("/data/json/2023/11/14/"));
        assert!(text.ends_with(".jsonl"));
        assert!(text.contains("711280073_bid_ask_"));
    }

    #[test]
    fn file_stem_round_trips() {
        let key = StreamKey::new(42, TickType::AllLast);
        let bucket = 1_699_999_200_000_000;
        let path = partition_path(Path::new("/x"), StorageFormat::Binary, key, bucket);
        let stem = path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(parse_file_stem(stem), Some((42, TickType::AllLast, bucket)));
    }

    #[test]
    fn one_open_entry_per_partition() {
        let index = PartitionIndex::new();
        let key = StreamKey::new(1, TickType::Last);
        index.ensure_open(key, StorageFormat::JsonLines, Path::new("/a"), 0);
        index.ensure_open(key, StorageFormat::JsonLines, Path::new("/b"), HOUR_US);

        let entries = index.entries(key, StorageFormat::JsonLines);
        let open: Vec<_> = entries
            .iter()
            .filter(|e| e.state == FileState::Open)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].hour_bucket_us, HOUR_US);
    }

    #[test]
    fn intersection_respects_span_and_state() {
        let index = PartitionIndex::new();
        let key = StreamKey::new(1, TickType::Last);
        index.ensure_open(key, StorageFormat::JsonLines, Path::new("/a"), 0);
        index.record_append(key, StorageFormat::JsonLines, 0, 100, 32);
        index.record_append(key, StorageFormat::JsonLines, 0, 900, 32);
        index.seal(key, StorageFormat::JsonLines, 0);

        index.ensure_open(key, StorageFormat::JsonLines, Path::new("/b"), HOUR_US);
        index.record_append(key, StorageFormat::JsonLines, HOUR_US, HOUR_US + 5, 32);

        // Sealed entry intersects.
        let hits = index.intersecting(1, &[TickType::Last], StorageFormat::JsonLines, 0, 500, false);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_count, 2);

        // Open entry only with include_open.
        let hits = index.intersecting(
            1,
            &[TickType::Last],
            StorageFormat::JsonLines,
            HOUR_US,
            HOUR_US + 10,
            false,
        );
        assert!(hits.is_empty());
        let hits = index.intersecting(
            1,
            &[TickType::Last],
            StorageFormat::JsonLines,
            HOUR_US,
            HOUR_US + 10,
            true,
        );
        assert_eq!(hits.len(), 1);

        // Failed entries never intersect.
        index.mark_failed(key, StorageFormat::JsonLines, HOUR_US);
        let hits = index.intersecting(
            1,
            &[TickType::Last],
            StorageFormat::JsonLines,
            HOUR_US,
            HOUR_US + 10,
            true,
        );
        assert!(hits.is_empty());
    }
}
