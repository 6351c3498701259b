//! Partitioned trace writer.
//!
//! Producers hand records to a bounded queue; one dedicated consumer thread
//! owns the open segment and appends records in queue order. Disk I/O never
//! runs on a producer thread.
//!
//! Backpressure is explicit: `enqueue` never blocks and returns
//! `ExecutionError::QueueFull` when the queue is at capacity, and
//! `enqueue_timeout` waits up to a deadline. Records are never dropped
//! silently.
//!
//! Shutdown closes the queue instead of sending a sentinel record: `stop`
//! releases the producer side, the consumer drains what is already queued,
//! closes its segment and exits.

/// Partition path derivation.
pub mod partition;
mod segment;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use tracing::{debug, info};

use crate::config::{Partitioning, TracesConfig};
use crate::error::{ExecutionError, TracesError, TracesResult};
use crate::trace::AssistTrace;

use segment::{SegmentSink, WriterCounters};

pub use partition::partition_dir;
pub use segment::WriterStats;

const QUEUE_NAME: &str = "writer";

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Output root.
    pub directory: PathBuf,
    /// Partition granularity.
    pub partitioning: Partitioning,
    /// Segment size cap in bytes.
    pub max_file_bytes: u64,
    /// Queue capacity.
    pub queue_size: usize,
}

impl WriterConfig {
    /// Creates a config with default sizes for the given root.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let defaults = TracesConfig::default();
        Self {
            directory: directory.into(),
            partitioning: defaults.partitioning,
            max_file_bytes: defaults.max_file_bytes(),
            queue_size: defaults.queue_size,
        }
    }
}

impl From<&TracesConfig> for WriterConfig {
    fn from(cfg: &TracesConfig) -> Self {
        Self {
            directory: cfg.sink_dir.clone(),
            partitioning: cfg.partitioning,
            max_file_bytes: cfg.max_file_bytes(),
            queue_size: cfg.queue_size,
        }
    }
}

enum WriterMsg {
    Record(Box<AssistTrace>),
    /// Close the open segment, then acknowledge.
    Flush { reply: Sender<()> },
}

/// Background writer persisting traces to gzip JSONL segments.
pub struct TraceWriter {
    cfg: WriterConfig,
    capacity: usize,
    tx: Mutex<Option<Sender<WriterMsg>>>,
    rx: Mutex<Option<Receiver<WriterMsg>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<WriterCounters>,
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("cfg", &self.cfg)
            .field("queue_depth", &self.queue_depth())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn lock_err(context: &'static str) -> TracesError {
    TracesError::internal(format!("poisoned lock: {context}"))
}

impl TraceWriter {
    /// Creates a writer. Records may be enqueued before `start`.
    #[must_use]
    pub fn new(cfg: WriterConfig) -> Self {
        let capacity = cfg.queue_size.max(1);
        let (tx, rx) = bounded::<WriterMsg>(capacity);
        Self {
            cfg,
            capacity,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            counters: Arc::new(WriterCounters::default()),
        }
    }

    /// Starts the consumer thread. Idempotent while running.
    ///
    /// # Errors
    ///
    /// Returns `WriterClosed` if the writer was already stopped.
    pub fn start(&self) -> TracesResult<()> {
        let mut worker = self.worker.lock().map_err(|_| lock_err("writer.start"))?;
        if worker.is_some() {
            return Ok(());
        }
        let rx = self
            .rx
            .lock()
            .map_err(|_| lock_err("writer.start"))?
            .take()
            .ok_or(ExecutionError::WriterClosed)?;

        let sink = self.sink();
        let handle = thread::Builder::new()
            .name("assist-traces-writer".to_string())
            .spawn(move || consume(&rx, sink))
            .map_err(|e| TracesError::internal(format!("failed to spawn writer thread: {e}")))?;
        *worker = Some(handle);

        info!(directory = %self.cfg.directory.display(), capacity = self.capacity, "trace writer started");
        Ok(())
    }

    /// Queues a record without blocking.
    ///
    /// # Errors
    ///
    /// `QueueFull` when at capacity, `WriterClosed` after `stop`.
    pub fn enqueue(&self, trace: AssistTrace) -> TracesResult<()> {
        let tx = self.sender()?;
        match tx.try_send(WriterMsg::Record(Box::new(trace))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                queue: QUEUE_NAME.to_string(),
                capacity: self.capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(disconnected()),
        }
    }

    /// Queues a record, waiting up to `timeout` for space.
    ///
    /// # Errors
    ///
    /// `Timeout` if no space frees up in time, `WriterClosed` after `stop`.
    pub fn enqueue_timeout(&self, trace: AssistTrace, timeout: Duration) -> TracesResult<()> {
        let tx = self.sender()?;
        match tx.send_timeout(WriterMsg::Record(Box::new(trace)), timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(ExecutionError::Timeout {
                queue: QUEUE_NAME.to_string(),
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into()),
            Err(SendTimeoutError::Disconnected(_)) => Err(disconnected()),
        }
    }

    /// Closes the open segment without stopping the consumer.
    ///
    /// Applied in queue order: every record queued before the call lands in
    /// the segment being closed. Returns once the segment is closed.
    ///
    /// # Errors
    ///
    /// `Disconnected` if the consumer died.
    pub fn flush(&self) -> TracesResult<()> {
        let running = self.worker.lock().map_err(|_| lock_err("writer.flush"))?.is_some();
        let Some(tx) = self.tx.lock().map_err(|_| lock_err("writer.flush"))?.clone() else {
            // Stopped: nothing is open.
            return Ok(());
        };
        if !running {
            return Ok(());
        }

        let (reply_tx, reply_rx) = bounded::<()>(1);
        tx.send(WriterMsg::Flush { reply: reply_tx }).map_err(|_| disconnected())?;
        drop(tx);
        reply_rx.recv().map_err(|_| disconnected())
    }

    /// Stops accepting records, drains the queue and closes the open segment.
    ///
    /// Safe to call more than once and safe to call on a writer that was never
    /// started; in that case already-queued records are written on the calling
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the consumer thread panicked. Storage
    /// failures are not errors here; they show up in `WriterStats::write_errors`.
    pub fn stop(&self) -> TracesResult<WriterStats> {
        drop(self.tx.lock().map_err(|_| lock_err("writer.stop"))?.take());

        let handle = self.worker.lock().map_err(|_| lock_err("writer.stop"))?.take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| TracesError::internal("writer thread panicked"))?;
        } else if let Some(rx) = self.rx.lock().map_err(|_| lock_err("writer.stop"))?.take() {
            consume(&rx, self.sink());
        }

        let stats = self.stats();
        info!(
            records = stats.records_written,
            bytes = stats.bytes_written,
            errors = stats.write_errors,
            "trace writer stopped"
        );
        Ok(stats)
    }

    /// Records waiting in the queue.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.tx
            .lock()
            .ok()
            .and_then(|tx| tx.as_ref().map(Sender::len))
            .unwrap_or(0)
    }

    /// Queue capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }

    /// The most recent storage failure, if any record has failed to persist.
    ///
    /// Failures never stop the consumer; this is how they are observed.
    #[must_use]
    pub fn last_error(&self) -> Option<ExecutionError> {
        self.counters.last_error()
    }

    fn sender(&self) -> TracesResult<Sender<WriterMsg>> {
        self.tx
            .lock()
            .map_err(|_| lock_err("writer.enqueue"))?
            .clone()
            .ok_or_else(|| ExecutionError::WriterClosed.into())
    }

    fn sink(&self) -> SegmentSink {
        SegmentSink::new(
            self.cfg.directory.clone(),
            self.cfg.partitioning,
            self.cfg.max_file_bytes,
            Arc::clone(&self.counters),
        )
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        // Deterministic shutdown: drain and join.
        let _ = self.stop();
    }
}

fn disconnected() -> TracesError {
    ExecutionError::Disconnected {
        worker: QUEUE_NAME.to_string(),
    }
    .into()
}

/// Consumer loop. Ends once every sender is gone and the queue is empty.
fn consume(rx: &Receiver<WriterMsg>, mut sink: SegmentSink) {
    for msg in rx.iter() {
        match msg {
            WriterMsg::Record(trace) => sink.append(&trace),
            WriterMsg::Flush { reply } => {
                sink.close_current();
                let _ = reply.send(());
            }
        }
    }
    sink.close_current();
    debug!("trace writer queue drained");
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{BufRead, BufReader};
    use std::path::Path;

    use flate2::read::MultiGzDecoder;
    use serde_json::Value;
    use tempfile::tempdir;

    use super::*;
    use crate::time::parse_timestamp;

    fn trace(id: &str) -> AssistTrace {
        let mut t = AssistTrace::new(id, parse_timestamp("2024-06-01T00:00:00").unwrap());
        t.model = "m".to_string();
        t
    }

    fn read_ids(path: &Path) -> Vec<String> {
        BufReader::new(MultiGzDecoder::new(File::open(path).unwrap()))
            .lines()
            .map(|l| {
                let v: Value = serde_json::from_str(&l.unwrap()).unwrap();
                v["trace_id"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn creates_partition_and_writes_record() {
        let dir = tempdir().unwrap();
        let writer = TraceWriter::new(WriterConfig::new(dir.path()));
        writer.start().unwrap();
        writer.enqueue(trace("1")).unwrap();
        let stats = writer.stop().unwrap();

        let path = dir.path().join("2024/06/01/model=m/part.jsonl.gz");
        assert_eq!(read_ids(&path), ["1"]);
        assert_eq!(stats.records_written, 1);
    }

    #[test]
    fn start_is_idempotent() {
        let dir = tempdir().unwrap();
        let writer = TraceWriter::new(WriterConfig::new(dir.path()));
        writer.start().unwrap();
        writer.start().unwrap();
        writer.enqueue(trace("1")).unwrap();
        writer.stop().unwrap();
        assert_eq!(writer.stats().records_written, 1);
    }

    #[test]
    fn stop_without_start_drains_queue_inline() {
        let dir = tempdir().unwrap();
        let writer = TraceWriter::new(WriterConfig::new(dir.path()));
        writer.enqueue(trace("1")).unwrap();
        writer.enqueue(trace("2")).unwrap();
        let stats = writer.stop().unwrap();
        assert_eq!(stats.records_written, 2);

        let empty = TraceWriter::new(WriterConfig::new(dir.path().join("never")));
        assert_eq!(empty.stop().unwrap(), WriterStats::default());
    }

    #[test]
    fn rejects_records_after_stop() {
        let dir = tempdir().unwrap();
        let writer = TraceWriter::new(WriterConfig::new(dir.path()));
        writer.start().unwrap();
        writer.stop().unwrap();
        let err = writer.enqueue(trace("late")).unwrap_err();
        assert!(matches!(err, TracesError::Execution(ExecutionError::WriterClosed)));
        assert!(writer.start().is_err());
        // Second stop is a no-op.
        writer.stop().unwrap();
    }

    #[test]
    fn full_queue_signals_backpressure() {
        let dir = tempdir().unwrap();
        let mut cfg = WriterConfig::new(dir.path());
        cfg.queue_size = 2;
        let writer = TraceWriter::new(cfg);
        // Not started, so nothing drains.
        writer.enqueue(trace("1")).unwrap();
        writer.enqueue(trace("2")).unwrap();
        assert_eq!(writer.queue_depth(), 2);

        let err = writer.enqueue(trace("3")).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            TracesError::Execution(ExecutionError::QueueFull { capacity: 2, .. })
        ));

        let err = writer
            .enqueue_timeout(trace("3"), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, TracesError::Execution(ExecutionError::Timeout { .. })));

        assert_eq!(writer.stop().unwrap().records_written, 2);
    }

    #[test]
    fn flush_closes_segment_and_consumer_keeps_running() {
        let dir = tempdir().unwrap();
        let writer = TraceWriter::new(WriterConfig::new(dir.path()));
        writer.start().unwrap();
        writer.enqueue(trace("1")).unwrap();
        writer.flush().unwrap();

        // Segment is complete on disk while the writer is still running.
        let path = dir.path().join("2024/06/01/model=m/part.jsonl.gz");
        assert_eq!(read_ids(&path), ["1"]);

        writer.enqueue(trace("2")).unwrap();
        writer.stop().unwrap();
        assert_eq!(read_ids(&path), ["1", "2"]);
        assert_eq!(writer.stats().segments_opened, 2);
    }

    #[test]
    fn flush_before_start_and_after_stop_is_noop() {
        let dir = tempdir().unwrap();
        let writer = TraceWriter::new(WriterConfig::new(dir.path()));
        writer.flush().unwrap();
        writer.start().unwrap();
        writer.stop().unwrap();
        writer.flush().unwrap();
    }

    #[test]
    fn storage_failure_is_observable_and_writing_continues() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("2024"), b"blocks the partition").unwrap();
        let writer = TraceWriter::new(WriterConfig::new(dir.path()));
        writer.start().unwrap();
        assert!(writer.last_error().is_none());

        writer.enqueue(trace("1")).unwrap();
        let mut later = AssistTrace::new("2", parse_timestamp("2025-01-01T00:00:00").unwrap());
        later.model = "m".to_string();
        writer.enqueue(later).unwrap();
        let stats = writer.stop().unwrap();

        assert_eq!(stats.write_errors, 1);
        assert_eq!(stats.records_written, 1);
        let err = writer.last_error().unwrap();
        assert!(matches!(err, ExecutionError::Storage { .. }));
        assert!(err.to_string().contains("model=m"));
        assert_eq!(read_ids(&dir.path().join("2025/01/01/model=m/part.jsonl.gz")), ["2"]);
    }
}
