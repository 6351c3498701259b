//! Trace service.
//!
//! `TraceService` is the one context object the host holds for the lifetime of
//! the integration: it owns the store, the writer and the correlator, and
//! implements every command. `setup` starts the background workers and
//! `unload` drains and releases them.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::TracesConfig;
use crate::correlator::{Correlator, CorrelatorConfig};
use crate::error::{ExecutionError, TracesError, TracesResult, ValidationError};
use crate::export::{self, DedupMode, ExportSummary};
use crate::host::EventBus;
use crate::pipeline::{PipelineObserver, PipelineTracer};
use crate::query::{self, TraceSensors, TraceStats, DEFAULT_PREVIEW_LIMIT};
use crate::redact::Redactor;
use crate::storage::{InMemoryTraceStore, TraceStore};
use crate::time;
use crate::trace::{payload_trace_id, AssistTrace};
use crate::writer::{TraceWriter, WriterConfig, WriterStats};

/// Annotation written by `set_feedback`.
///
/// All three annotation fields are replaced; a field left out is cleared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackUpdate {
    /// Trace to annotate.
    pub trace_id: String,
    /// Free-form feedback, e.g. `"thumbs_down"`.
    #[serde(default)]
    pub feedback: Option<String>,
    /// What the user actually wanted, in their words.
    #[serde(default)]
    pub repair_text: Option<String>,
    /// Corrected action used as a dataset label.
    #[serde(default)]
    pub gold_action: Option<Value>,
}

/// Snapshot of the service's runtime state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Effective options.
    pub options: TracesConfig,
    /// Records waiting in the writer queue.
    pub queue_depth: usize,
    /// Writer queue capacity.
    pub queue_capacity: usize,
    /// Writer counters.
    pub writer: WriterStats,
    /// Most recent storage failure of the writer, if any.
    pub last_write_error: Option<String>,
    /// Correlator watches still pending.
    pub pending_watches: usize,
    /// Traces held in memory.
    pub traces_held: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportRequest {
    output_path: Option<PathBuf>,
    dedup: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PreviewRequest {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TraceIdRequest {
    trace_id: String,
}

/// Commands accepted by [`TraceService::dispatch`].
pub const COMMANDS: [&str; 10] = [
    "log_event",
    "set_feedback",
    "export_sft",
    "export_prefs",
    "flush",
    "preview_recent",
    "trace_by_id",
    "stats",
    "sensors",
    "diagnostics",
];

/// The integration context.
pub struct TraceService {
    config: TracesConfig,
    store: Arc<dyn TraceStore>,
    writer: Arc<TraceWriter>,
    correlator: Correlator,
    redactor: Arc<Redactor>,
    tracer: Arc<PipelineTracer>,
}

impl std::fmt::Debug for TraceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceService")
            .field("config", &self.config)
            .field("writer", &self.writer)
            .field("correlator", &self.correlator)
            .finish_non_exhaustive()
    }
}

impl TraceService {
    /// Builds the service on a fresh in-memory store and starts its workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a worker thread
    /// cannot be started.
    pub fn setup(config: TracesConfig, bus: Arc<dyn EventBus>) -> TracesResult<Self> {
        Self::with_store(config, Arc::new(InMemoryTraceStore::new()), bus)
    }

    /// Builds the service on an existing store and starts its workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a worker thread
    /// cannot be started.
    pub fn with_store(config: TracesConfig, store: Arc<dyn TraceStore>, bus: Arc<dyn EventBus>) -> TracesResult<Self> {
        let config = config.validate()?;
        let writer = Arc::new(TraceWriter::new(WriterConfig::from(&config)));
        writer.start()?;
        let correlator = Correlator::new(Arc::clone(&store), bus, CorrelatorConfig::from(&config))?;
        let redactor = Arc::new(Redactor::from_config(&config));
        let tracer = Arc::new(PipelineTracer::new(
            Arc::clone(&store),
            Arc::clone(&writer),
            Arc::clone(&redactor),
            config.enabled,
        ));

        info!(
            sink_dir = %config.sink_dir.display(),
            partitioning = ?config.partitioning,
            redaction = ?config.redaction_level,
            enabled = config.enabled,
            "assist traces set up"
        );
        Ok(Self {
            config,
            store,
            writer,
            correlator,
            redactor,
            tracer,
        })
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &TracesConfig {
        &self.config
    }

    /// The shared trace store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    /// The writer.
    #[must_use]
    pub fn writer(&self) -> &TraceWriter {
        &self.writer
    }

    /// The correlator.
    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Observer to register with the host's pipeline event source.
    #[must_use]
    pub fn pipeline_observer(&self) -> Arc<dyn PipelineObserver> {
        Arc::clone(&self.tracer) as Arc<dyn PipelineObserver>
    }

    /// The pipeline tracer.
    #[must_use]
    pub fn pipeline_tracer(&self) -> &PipelineTracer {
        &self.tracer
    }

    /// Ingests a full or partial trace.
    ///
    /// New traces are validated in full; updates are merged into the stored
    /// record. A redacted copy is queued for persistence and, while the
    /// outcome is still unknown, a correlator watch is (re)registered on the
    /// action's target entities. Returns the stored trace, or `None` when
    /// tracing is disabled.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed payload and `QueueFull` when
    /// the writer cannot take the record. In both cases the store is untouched,
    /// so a retry applies the update exactly once.
    pub fn log_event(&self, payload: Value) -> TracesResult<Option<AssistTrace>> {
        let trace_id = payload_trace_id(&payload)?;
        if !self.config.enabled {
            debug!(trace_id = %trace_id, "tracing disabled; log_event ignored");
            return Ok(None);
        }

        // The record is queued before it is committed, so a rejected call
        // leaves the stored trace exactly as it was.
        let (trace, created) = self.store.upsert_with(
            &trace_id,
            &mut || {
                let trace = AssistTrace::from_value(payload.clone())?;
                self.persist(&trace)?;
                Ok(trace)
            },
            &mut |existing| {
                let mut next = existing.clone();
                next.merge(payload.clone())?;
                self.persist(&next)?;
                *existing = next;
                Ok(())
            },
        )?;
        debug!(trace_id = %trace_id, created, "trace ingested");

        let entities = trace.target_entity_ids();
        if !entities.is_empty() && !trace.result.is_terminal() {
            self.correlator.add_trace(&trace_id, entities)?;
        }
        Ok(Some(trace))
    }

    fn persist(&self, trace: &AssistTrace) -> TracesResult<()> {
        let redacted = self.redactor.redact_trace(trace)?;
        self.writer.enqueue(redacted)
    }

    /// Writes the annotation fields of an existing trace.
    ///
    /// # Errors
    ///
    /// Returns `TraceNotFound` if the trace is unknown; nothing is changed.
    pub fn set_feedback(&self, update: FeedbackUpdate) -> TracesResult<()> {
        let FeedbackUpdate {
            trace_id,
            feedback,
            repair_text,
            gold_action,
        } = update;
        let mut fields = Some((feedback, repair_text, gold_action));
        let found = self.store.update(&trace_id, &mut |trace| {
            if let Some((feedback, repair_text, gold_action)) = fields.take() {
                trace.user_feedback = feedback;
                trace.repair_text = repair_text;
                trace.gold_action = gold_action;
            }
        })?;
        if !found {
            return Err(ExecutionError::TraceNotFound { trace_id }.into());
        }
        debug!(trace_id = %trace_id, "feedback recorded");
        Ok(())
    }

    /// Exports the SFT dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the file cannot be written.
    pub fn export_sft(&self, output: Option<PathBuf>, dedup: DedupMode) -> TracesResult<ExportSummary> {
        let traces = self.store.snapshot()?;
        export::export_sft(&traces, output.as_deref(), &self.config.dataset_dir, dedup)
    }

    /// Exports the preference dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the file cannot be written.
    pub fn export_prefs(&self, output: Option<PathBuf>) -> TracesResult<ExportSummary> {
        let traces = self.store.snapshot()?;
        export::export_prefs(&traces, output.as_deref(), &self.config.dataset_dir)
    }

    /// Closes the open segment so the next record starts a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer is gone.
    pub fn flush(&self) -> TracesResult<()> {
        self.writer.flush()
    }

    /// The `limit` most recent traces, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn preview_recent(&self, limit: usize) -> TracesResult<Vec<AssistTrace>> {
        query::preview_recent(self.store.as_ref(), limit)
    }

    /// One trace by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn trace_by_id(&self, trace_id: &str) -> TracesResult<Option<AssistTrace>> {
        query::trace_by_id(self.store.as_ref(), trace_id)
    }

    /// Outcome counts and mean latency.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn stats(&self) -> TracesResult<TraceStats> {
        query::stats(self.store.as_ref())
    }

    /// 24-hour telemetry as of now.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn sensors(&self) -> TracesResult<TraceSensors> {
        query::sensors(self.store.as_ref(), time::now())
    }

    /// Runtime state for troubleshooting.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn diagnostics(&self) -> TracesResult<Diagnostics> {
        Ok(Diagnostics {
            options: self.config.clone(),
            queue_depth: self.writer.queue_depth(),
            queue_capacity: self.writer.capacity(),
            writer: self.writer.stats(),
            last_write_error: self.writer.last_error().map(|e| e.to_string()),
            pending_watches: self.correlator.pending_count(),
            traces_held: self.store.len()?,
        })
    }

    /// Runs a named command with a JSON payload and returns its JSON result.
    ///
    /// Commands without a result return `null`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCommand` for names outside [`COMMANDS`], a validation
    /// error for a malformed payload, and otherwise whatever the command
    /// returns.
    pub fn dispatch(&self, name: &str, payload: Value) -> TracesResult<Value> {
        let payload = if payload.is_null() { json!({}) } else { payload };
        match name {
            "log_event" => {
                let trace = match payload.get("trace") {
                    Some(inner) => inner.clone(),
                    None => payload,
                };
                Ok(match self.log_event(trace)? {
                    Some(t) => json!({ "trace_id": t.trace_id }),
                    None => Value::Null,
                })
            }
            "set_feedback" => {
                self.set_feedback(parse_request(name, payload)?)?;
                Ok(Value::Null)
            }
            "export_sft" => {
                let req: ExportRequest = parse_request(name, payload)?;
                let dedup = match req.dedup.as_deref() {
                    Some(mode) => mode.parse()?,
                    None => DedupMode::None,
                };
                Ok(serde_json::to_value(self.export_sft(req.output_path, dedup)?)?)
            }
            "export_prefs" => {
                let req: ExportRequest = parse_request(name, payload)?;
                Ok(serde_json::to_value(self.export_prefs(req.output_path)?)?)
            }
            "flush" => {
                self.flush()?;
                Ok(Value::Null)
            }
            "preview_recent" => {
                let req: PreviewRequest = parse_request(name, payload)?;
                let limit = req.limit.unwrap_or(DEFAULT_PREVIEW_LIMIT);
                Ok(serde_json::to_value(self.preview_recent(limit)?)?)
            }
            "trace_by_id" => {
                let req: TraceIdRequest = parse_request(name, payload)?;
                Ok(serde_json::to_value(self.trace_by_id(&req.trace_id)?)?)
            }
            "stats" => Ok(serde_json::to_value(self.stats()?)?),
            "sensors" => Ok(serde_json::to_value(self.sensors()?)?),
            "diagnostics" => Ok(serde_json::to_value(self.diagnostics()?)?),
            other => Err(ValidationError::UnknownCommand {
                name: other.to_string(),
            }
            .into()),
        }
    }

    /// Drains the writer, releases the correlator and returns the final
    /// writer counters. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer thread cannot be joined.
    pub fn unload(&self) -> TracesResult<WriterStats> {
        self.correlator.shutdown();
        let stats = self.writer.stop()?;
        info!(
            records = stats.records_written,
            write_errors = stats.write_errors,
            "assist traces unloaded"
        );
        Ok(stats)
    }
}

impl Drop for TraceService {
    fn drop(&mut self) {
        if let Err(e) = self.unload() {
            warn!(error = %e, "failed to unload assist traces");
        }
    }
}

fn parse_request<T: for<'de> Deserialize<'de>>(command: &str, payload: Value) -> TracesResult<T> {
    serde_json::from_value(payload).map_err(|e| {
        TracesError::Validation(ValidationError::InvalidPayload {
            reason: format!("{command}: {e}"),
        })
    })
}
