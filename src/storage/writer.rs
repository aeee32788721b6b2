//! Hourly-rotating partition writers and the storage pipeline task.
//!
//! One pipeline task owns every open file descriptor; the fan-out path
//! hands records over through a bounded channel and never blocks on disk.
//! Each enabled format keeps its own set of open partitions, so a failure
//! in one format cannot disturb the other.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{binary, json_lines};
use crate::models::{StreamKey, TickRecord};
use crate::storage::index::{partition_path, PartitionIndex};
use crate::storage::StorageFormat;
use crate::supervisor::tasks::{spawn_supervised, Worker};

/// Cadence of background flushes for open partition files.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

enum StoreMsg {
    Tick(TickRecord),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Snapshot of the storage pipeline for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub enabled: bool,
    pub formats: Vec<StorageFormat>,
}

/// Handle to the storage pipeline. Cheap to clone; all clones feed the same
/// worker task.
#[derive(Clone)]
pub struct TickStore {
    tx: mpsc::Sender<StoreMsg>,
    formats: Arc<Vec<StorageFormat>>,
}

impl TickStore {
    /// Spawn the pipeline worker under supervision and return the handle.
    pub fn spawn(
        root: PathBuf,
        formats: Vec<StorageFormat>,
        index: Arc<PartitionIndex>,
        queue_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let writers = formats
            .iter()
            .map(|f| FormatWriter::new(*f, root.clone(), index.clone()))
            .collect();
        let worker = Arc::new(Mutex::new(StoreWorker { rx, writers }));
        let handle = spawn_supervised("storage-pipeline", shutdown, worker);
        (
            Self {
                tx,
                formats: Arc::new(formats),
            },
            handle,
        )
    }

    /// Enqueue one record for persistence. Non-blocking: if the pipeline is
    /// saturated the record is dropped with a warning rather than stalling
    /// the fan-out path.
    pub fn record(&self, record: TickRecord) {
        if let Err(e) = self.tx.try_send(StoreMsg::Tick(record)) {
            warn!(error = %e, "storage queue full, dropping tick");
        }
    }

    /// Flush all open partition files and wait for completion.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(StoreMsg::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Flush and close every open file, then stop the worker.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(StoreMsg::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn status(&self) -> StorageStatus {
        StorageStatus {
            enabled: !self.formats.is_empty(),
            formats: self.formats.as_ref().clone(),
        }
    }
}

struct StoreWorker {
    rx: mpsc::Receiver<StoreMsg>,
    writers: Vec<FormatWriter>,
}

#[async_trait]
impl Worker for StoreWorker {
    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(StoreMsg::Tick(record)) => {
                        for writer in &mut self.writers {
                            writer.append(&record);
                        }
                    }
                    Some(StoreMsg::Flush(done)) => {
                        for writer in &mut self.writers {
                            writer.flush_all();
                        }
                        let _ = done.send(());
                    }
                    Some(StoreMsg::Shutdown(done)) => {
                        for writer in &mut self.writers {
                            writer.close_all();
                        }
                        let _ = done.send(());
                        return Ok(());
                    }
                    None => {
                        for writer in &mut self.writers {
                            writer.close_all();
                        }
                        return Ok(());
                    }
                },
                _ = flush_tick.tick() => {
                    for writer in &mut self.writers {
                        writer.flush_all();
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        for writer in &mut self.writers {
                            writer.close_all();
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

struct OpenPartition {
    writer: BufWriter<File>,
    hour_bucket_us: i64,
}

/// Per-format partition writer. Owns every open descriptor for its format;
/// no file handle is shared across tasks.
struct FormatWriter {
    format: StorageFormat,
    root: PathBuf,
    index: Arc<PartitionIndex>,
    open: HashMap<StreamKey, OpenPartition>,
}

impl FormatWriter {
    fn new(format: StorageFormat, root: PathBuf, index: Arc<PartitionIndex>) -> Self {
        Self {
            format,
            root,
            index,
            open: HashMap::new(),
        }
    }

    /// Append one record, rotating on an hour-bucket change. Errors are
    /// contained here: the entry is marked failed and the partition is
    /// dropped so the next record reopens it.
    fn append(&mut self, record: &TickRecord) {
        let key = record.key();
        let bucket = record.hour_bucket_us();
        match self.append_inner(key, bucket, record) {
            Ok(bytes) => {
                self.index
                    .record_append(key, self.format, bucket, record.event_ts_us, bytes);
            }
            Err(e) => {
                error!(
                    stream = %key,
                    format = %self.format,
                    error = %e,
                    "storage write failed, will reopen on next record"
                );
                self.index.mark_failed(key, self.format, bucket);
                self.open.remove(&key);
            }
        }
    }

    fn append_inner(
        &mut self,
        key: StreamKey,
        bucket: i64,
        record: &TickRecord,
    ) -> io::Result<u64> {
        let rotate_from = match self.open.get(&key) {
            Some(partition) if partition.hour_bucket_us == bucket => None,
            Some(partition) => Some(partition.hour_bucket_us),
            None => None,
        };

        if self.open.get(&key).is_none() || rotate_from.is_some() {
            // Open the new bucket before touching the old one: a crash in
            // between leaves at most a duplicate at the boundary, never a
            // gap.
            let fresh = self.open_partition(key, bucket)?;
            let previous = self.open.insert(key, fresh);
            if let (Some(old), Some(old_bucket)) = (previous, rotate_from) {
                self.seal_partition(key, old_bucket, old);
            }
        }

        let partition = self
            .open
            .get_mut(&key)
            .expect("partition inserted just above");
        let bytes = match self.format {
            StorageFormat::JsonLines => {
                let mut line = json_lines::encode_line(record)?;
                line.push(b'\n');
                partition.writer.write_all(&line)?;
                line.len() as u64
            }
            StorageFormat::Binary => {
                let payload = binary::encode_tick(record);
                binary::write_frame(&mut partition.writer, &payload)?;
                (payload.len() + 4) as u64
            }
        };
        Ok(bytes)
    }

    fn open_partition(&mut self, key: StreamKey, bucket: i64) -> io::Result<OpenPartition> {
        let path = partition_path(&self.root, self.format, key, bucket);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existing_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);

        if self.format == StorageFormat::Binary && existing_len == 0 {
            let header = binary::FileHeader::new(key.contract_id, key.tick_type, bucket);
            binary::write_frame(&mut writer, &binary::encode_header(&header))?;
            writer.flush()?;
        }

        self.index.ensure_open(key, self.format, &path, bucket);
        debug!(stream = %key, format = %self.format, path = %path.display(), "opened partition");
        Ok(OpenPartition {
            writer,
            hour_bucket_us: bucket,
        })
    }

    fn seal_partition(&mut self, key: StreamKey, bucket: i64, mut partition: OpenPartition) {
        if let Err(e) = partition.writer.flush() {
            error!(stream = %key, format = %self.format, error = %e, "flush on rotation failed");
            self.index.mark_failed(key, self.format, bucket);
            return;
        }
        self.index.seal(key, self.format, bucket);
        info!(stream = %key, format = %self.format, hour_bucket_us = bucket, "sealed partition");
    }

    fn flush_all(&mut self) {
        let mut failed = Vec::new();
        for (key, partition) in self.open.iter_mut() {
            if let Err(e) = partition.writer.flush() {
                error!(stream = %key, format = %self.format, error = %e, "background flush failed");
                self.index
                    .mark_failed(*key, self.format, partition.hour_bucket_us);
                failed.push(*key);
            }
        }
        for key in failed {
            self.open.remove(&key);
        }
    }

    fn close_all(&mut self) {
        self.flush_all();
        self.open.clear();
    }
}
