//! Gzip segment sink.
//!
//! The sink keeps at most one segment open. Each appended line is one
//! serialized trace. Reopening an existing segment appends a new gzip member,
//! so readers must use a multi-member decoder.
//!
//! Size accounting mixes two units. While a segment is open it counts
//! uncompressed line bytes. When an existing segment is reopened the count is
//! seeded from its compressed size on disk, because recovering the
//! uncompressed size would mean decoding the whole file. A reopened segment can
//! therefore hold more than the cap in uncompressed data before it rotates.
//! Once a segment passes the cap it is closed and the next write to that
//! partition opens the next sequence number.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Partitioning;
use crate::error::ExecutionError;
use crate::trace::AssistTrace;

use super::partition::{parse_segment_seq, partition_dir, segment_file_name};

/// Writer counters, shared between the consumer thread and observers.
#[derive(Debug, Default)]
pub(crate) struct WriterCounters {
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    segments_opened: AtomicU64,
    rotations: AtomicU64,
    write_errors: AtomicU64,
    /// Path and message of the most recent storage failure.
    last_error: Mutex<Option<(String, String)>>,
}

impl WriterCounters {
    fn record_failure(&self, path: &Path, err: &io::Error) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some((path.display().to_string(), err.to_string()));
        }
    }

    pub(crate) fn last_error(&self) -> Option<ExecutionError> {
        let last = self.last_error.lock().ok()?;
        last.as_ref().map(|(path, message)| ExecutionError::Storage {
            path: path.clone(),
            message: message.clone(),
        })
    }

    pub(crate) fn snapshot(&self) -> WriterStats {
        WriterStats {
            records_written: self.records_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            segments_opened: self.segments_opened.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time writer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    /// Records appended successfully.
    pub records_written: u64,
    /// Uncompressed line bytes appended.
    pub bytes_written: u64,
    /// Segment files opened (new or reopened).
    pub segments_opened: u64,
    /// Segments closed because they passed the size cap.
    pub rotations: u64,
    /// Records that could not be written.
    pub write_errors: u64,
}

struct OpenSegment {
    dir: PathBuf,
    path: PathBuf,
    seq: u32,
    encoder: GzEncoder<BufWriter<File>>,
    size: u64,
}

impl OpenSegment {
    fn close(self) -> io::Result<PathBuf> {
        let mut inner = self.encoder.finish()?;
        inner.flush()?;
        inner.get_ref().sync_data()?;
        Ok(self.path)
    }
}

pub(crate) struct SegmentSink {
    root: PathBuf,
    partitioning: Partitioning,
    max_bytes: u64,
    current: Option<OpenSegment>,
    /// First sequence number allowed per partition after a rotation.
    next_seq: HashMap<PathBuf, u32>,
    counters: Arc<WriterCounters>,
}

impl SegmentSink {
    pub(crate) fn new(
        root: PathBuf,
        partitioning: Partitioning,
        max_bytes: u64,
        counters: Arc<WriterCounters>,
    ) -> Self {
        Self {
            root,
            partitioning,
            max_bytes: max_bytes.max(1),
            current: None,
            next_seq: HashMap::new(),
            counters,
        }
    }

    /// Appends one trace. Failures are logged and counted, never raised.
    pub(crate) fn append(&mut self, trace: &AssistTrace) {
        let dir = partition_dir(&self.root, &trace.ts, trace.model_key(), self.partitioning);
        if let Err(e) = self.try_append(trace, &dir) {
            self.counters.record_failure(&dir, &e);
            warn!(trace_id = %trace.trace_id, dir = %dir.display(), error = %e, "failed to persist trace");
            // The handle may be half-written; start over on the next record.
            if let Some(seg) = self.current.take() {
                let _ = seg.close();
            }
        }
    }

    fn try_append(&mut self, trace: &AssistTrace, dir: &Path) -> io::Result<()> {
        if self.current.as_ref().map_or(true, |seg| seg.dir != dir) {
            self.close_current();
            self.current = Some(self.open(dir.to_path_buf())?);
        }

        let mut line = serde_json::to_vec(trace).map_err(io::Error::from)?;
        line.push(b'\n');
        let len = line.len() as u64;

        let Some(seg) = self.current.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "no open segment"));
        };
        seg.encoder.write_all(&line)?;
        seg.size += len;
        self.counters.records_written.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_written.fetch_add(len, Ordering::Relaxed);

        if seg.size > self.max_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    /// Closes the open segment, if any.
    pub(crate) fn close_current(&mut self) {
        if let Some(seg) = self.current.take() {
            let path = seg.path.clone();
            match seg.close() {
                Ok(path) => debug!(path = %path.display(), "closed segment"),
                Err(e) => {
                    self.counters.record_failure(&path, &e);
                    warn!(path = %path.display(), error = %e, "failed to close segment");
                }
            }
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        let Some(seg) = self.current.take() else {
            return Ok(());
        };
        let dir = seg.dir.clone();
        let seq = seg.seq;
        let size = seg.size;
        self.next_seq.insert(dir, seq.saturating_add(1));
        self.counters.rotations.fetch_add(1, Ordering::Relaxed);
        let path = seg.close()?;
        debug!(path = %path.display(), size, "rotated segment");
        Ok(())
    }

    fn open(&self, dir: PathBuf) -> io::Result<OpenSegment> {
        fs::create_dir_all(&dir)?;

        let floor = self.next_seq.get(&dir).copied().unwrap_or(0);
        let mut seq = highest_segment(&dir)?.unwrap_or(0).max(floor);
        let mut path = dir.join(segment_file_name(seq));
        let mut size = file_len(&path)?;
        if size > self.max_bytes {
            seq = seq.saturating_add(1);
            path = dir.join(segment_file_name(seq));
            size = file_len(&path)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.counters.segments_opened.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), size, "opened segment");

        Ok(OpenSegment {
            dir,
            path,
            seq,
            encoder: GzEncoder::new(BufWriter::new(file), Compression::default()),
            size,
        })
    }
}

impl Drop for SegmentSink {
    fn drop(&mut self) {
        self.close_current();
    }
}

fn highest_segment(dir: &Path) -> io::Result<Option<u32>> {
    let mut highest = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(seq) = entry.file_name().to_str().and_then(parse_segment_seq) {
            highest = Some(highest.map_or(seq, |h: u32| h.max(seq)));
        }
    }
    Ok(highest)
}

fn file_len(path: &Path) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};

    use flate2::read::MultiGzDecoder;
    use serde_json::Value;
    use tempfile::tempdir;

    use super::*;
    use crate::time::parse_timestamp;

    fn trace(id: &str, ts: &str, model: &str) -> AssistTrace {
        let mut t = AssistTrace::new(id, parse_timestamp(ts).unwrap());
        t.model = model.to_string();
        t
    }

    fn read_ids(path: &Path) -> Vec<String> {
        let reader = BufReader::new(MultiGzDecoder::new(File::open(path).unwrap()));
        reader
            .lines()
            .map(|l| {
                let v: Value = serde_json::from_str(&l.unwrap()).unwrap();
                v["trace_id"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn reopening_appends_a_new_member() {
        let dir = tempdir().unwrap();
        let counters = Arc::new(WriterCounters::default());
        {
            let mut sink = SegmentSink::new(dir.path().to_path_buf(), Partitioning::Daily, 1 << 20, Arc::clone(&counters));
            sink.append(&trace("1", "2024-06-01T00:00:00", "m"));
        }
        {
            let mut sink = SegmentSink::new(dir.path().to_path_buf(), Partitioning::Daily, 1 << 20, Arc::clone(&counters));
            sink.append(&trace("2", "2024-06-01T05:00:00", "m"));
        }
        let path = dir.path().join("2024/06/01/model=m/part.jsonl.gz");
        assert_eq!(read_ids(&path), ["1", "2"]);
        assert_eq!(counters.snapshot().segments_opened, 2);
    }

    #[test]
    fn switching_partitions_closes_previous_segment() {
        let dir = tempdir().unwrap();
        let counters = Arc::new(WriterCounters::default());
        let mut sink = SegmentSink::new(dir.path().to_path_buf(), Partitioning::Daily, 1 << 20, Arc::clone(&counters));
        sink.append(&trace("1", "2024-06-01T00:00:00", "a"));
        sink.append(&trace("2", "2024-06-01T00:00:00", "b"));
        sink.append(&trace("3", "2024-06-01T00:00:00", "a"));
        drop(sink);

        assert_eq!(read_ids(&dir.path().join("2024/06/01/model=a/part.jsonl.gz")), ["1", "3"]);
        assert_eq!(read_ids(&dir.path().join("2024/06/01/model=b/part.jsonl.gz")), ["2"]);
        assert_eq!(counters.snapshot().segments_opened, 3);
    }

    #[test]
    fn rotation_moves_to_next_sequence() {
        let dir = tempdir().unwrap();
        let counters = Arc::new(WriterCounters::default());
        // Every line is larger than the cap, so every record rotates.
        let mut sink = SegmentSink::new(dir.path().to_path_buf(), Partitioning::Daily, 16, Arc::clone(&counters));
        for id in ["1", "2", "3"] {
            sink.append(&trace(id, "2024-06-01T00:00:00", "m"));
        }
        drop(sink);

        let part = dir.path().join("2024/06/01/model=m");
        assert_eq!(read_ids(&part.join("part.jsonl.gz")), ["1"]);
        assert_eq!(read_ids(&part.join("part-00001.jsonl.gz")), ["2"]);
        assert_eq!(read_ids(&part.join("part-00002.jsonl.gz")), ["3"]);
        assert_eq!(counters.snapshot().rotations, 3);
    }

    #[test]
    fn unwritable_partition_is_counted_not_raised() {
        let dir = tempdir().unwrap();
        // A plain file where the year directory should be.
        fs::write(dir.path().join("2024"), b"not a directory").unwrap();
        let counters = Arc::new(WriterCounters::default());
        let mut sink = SegmentSink::new(dir.path().to_path_buf(), Partitioning::Daily, 1 << 20, Arc::clone(&counters));
        sink.append(&trace("1", "2024-06-01T00:00:00", "m"));
        sink.append(&trace("2", "2025-01-01T00:00:00", "m"));
        drop(sink);

        let stats = counters.snapshot();
        assert_eq!(stats.write_errors, 1);
        assert_eq!(stats.records_written, 1);
        match counters.last_error() {
            Some(ExecutionError::Storage { path, .. }) => assert!(path.ends_with("model=m")),
            other => panic!("expected a storage error, got {other:?}"),
        }
        assert_eq!(read_ids(&dir.path().join("2025/01/01/model=m/part.jsonl.gz")), ["2"]);
    }
}
