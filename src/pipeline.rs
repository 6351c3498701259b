//! Pipeline run tracing.
//!
//! The host reports every lifecycle event of an assistant pipeline run to the
//! registered [`PipelineObserver`]s. [`PipelineTracer`] folds those events into
//! the trace keyed by the run id and hands a redacted copy to the writer when
//! the run ends.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::TracesResult;
use crate::redact::Redactor;
use crate::storage::TraceStore;
use crate::time::parse_timestamp;
use crate::trace::AssistTrace;
use crate::writer::TraceWriter;

/// Lifecycle event kinds emitted by a pipeline run.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineEventType {
    RunStart,
    RunEnd,
    WakeWordStart,
    WakeWordEnd,
    SttStart,
    SttVadStart,
    SttVadEnd,
    SttEnd,
    IntentStart,
    IntentProgress,
    IntentEnd,
    TtsStart,
    TtsEnd,
    Error,
    /// Any event kind this crate does not interpret.
    #[serde(other)]
    Other,
}

/// One pipeline lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: PipelineEventType,
    /// Event payload.
    #[serde(default)]
    pub data: Option<Value>,
    /// ISO-8601 time the event was emitted.
    pub timestamp: String,
}

impl PipelineEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(event_type: PipelineEventType, data: Option<Value>, timestamp: impl Into<String>) -> Self {
        Self {
            event_type,
            data,
            timestamp: timestamp.into(),
        }
    }
}

/// Bound on how long a finished run waits for writer capacity.
pub const DEFAULT_RUN_END_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives pipeline events from the host. Returns promptly; only a run-end
/// may wait, bounded, for writer capacity.
pub trait PipelineObserver: Send + Sync {
    /// Called once per event of run `run_id`, in emission order.
    fn on_event(&self, run_id: &str, event: &PipelineEvent);
}

/// Builds traces from pipeline events.
pub struct PipelineTracer {
    store: Arc<dyn TraceStore>,
    writer: Arc<TraceWriter>,
    redactor: Arc<Redactor>,
    enabled: bool,
    run_end_timeout: Duration,
}

impl std::fmt::Debug for PipelineTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineTracer")
            .field("enabled", &self.enabled)
            .field("run_end_timeout", &self.run_end_timeout)
            .finish_non_exhaustive()
    }
}

impl PipelineTracer {
    /// Creates a tracer writing into `store` and persisting through `writer`.
    #[must_use]
    pub fn new(store: Arc<dyn TraceStore>, writer: Arc<TraceWriter>, redactor: Arc<Redactor>, enabled: bool) -> Self {
        Self {
            store,
            writer,
            redactor,
            enabled,
            run_end_timeout: DEFAULT_RUN_END_TIMEOUT,
        }
    }

    /// Sets how long a run-end waits for space in a full writer queue.
    #[must_use]
    pub const fn with_run_end_timeout(mut self, timeout: Duration) -> Self {
        self.run_end_timeout = timeout;
        self
    }

    /// Applies one event to the trace of `run_id` and returns the updated
    /// trace, or `None` when tracing is disabled.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the first event of a run carries an
    /// unparseable timestamp, and an execution error if the finished trace
    /// cannot be queued for persistence.
    pub fn process(&self, run_id: &str, event: &PipelineEvent) -> TracesResult<Option<AssistTrace>> {
        if !self.enabled {
            debug!(run_id, "tracing disabled; pipeline event ignored");
            return Ok(None);
        }

        let (trace, created) = self.store.upsert_with(
            run_id,
            &mut || {
                let mut trace = AssistTrace::new(run_id, parse_timestamp(&event.timestamp)?);
                apply_event(&mut trace, event);
                Ok(trace)
            },
            &mut |trace| {
                apply_event(trace, event);
                Ok(())
            },
        )?;
        if created {
            debug!(run_id, "pipeline run traced");
        }

        if event.event_type == PipelineEventType::RunEnd {
            let redacted = self.redactor.redact_trace(&trace)?;
            // Run-ends are not retried upstream: wait, bounded, for capacity.
            self.writer.enqueue_timeout(redacted, self.run_end_timeout)?;
            debug!(run_id, latency_ms = trace.latency_ms, "pipeline run complete");
        }
        Ok(Some(trace))
    }
}

impl PipelineObserver for PipelineTracer {
    fn on_event(&self, run_id: &str, event: &PipelineEvent) {
        if let Err(e) = self.process(run_id, event) {
            warn!(run_id, event = ?event.event_type, error = %e, "failed to trace pipeline event");
        }
    }
}

fn apply_event(trace: &mut AssistTrace, event: &PipelineEvent) {
    trace.ha_events.push(json!({
        "type": event.event_type,
        "data": event.data,
        "timestamp": event.timestamp,
    }));

    let data = event.data.as_ref();
    match event.event_type {
        PipelineEventType::SttEnd => {
            if let Some(data) = data {
                trace.user_text = data
                    .pointer("/stt_output/text")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
        PipelineEventType::IntentEnd => {
            let Some(output) = data.and_then(|d| d.get("intent_output")) else {
                return;
            };
            let plain = output.pointer("/response/speech/plain");
            if let Some(speech) = plain
                .and_then(|p| p.get("speech").or_else(|| p.get("text")))
                .and_then(Value::as_str)
            {
                trace.response_text = speech.to_string();
            }
            trace.context = object_or_empty(output.get("context"));
            trace.entities = object_or_empty(output.get("entities"));
        }
        PipelineEventType::RunEnd => {
            if let Ok(end) = parse_timestamp(&event.timestamp) {
                let elapsed = end.signed_duration_since(trace.ts).num_milliseconds();
                trace.latency_ms = u64::try_from(elapsed).unwrap_or(0);
            }
        }
        _ => {}
    }
}

fn object_or_empty(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    use flate2::read::MultiGzDecoder;
    use tempfile::tempdir;

    use super::*;
    use crate::config::RedactionLevel;
    use crate::storage::InMemoryTraceStore;
    use crate::writer::WriterConfig;

    struct Harness {
        store: Arc<InMemoryTraceStore>,
        writer: Arc<TraceWriter>,
        tracer: PipelineTracer,
        _dir: tempfile::TempDir,
    }

    fn harness(enabled: bool) -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryTraceStore::new());
        let writer = Arc::new(TraceWriter::new(WriterConfig::new(dir.path())));
        writer.start().unwrap();
        let tracer = PipelineTracer::new(
            Arc::clone(&store) as Arc<dyn TraceStore>,
            Arc::clone(&writer),
            Arc::new(Redactor::new(RedactionLevel::Basic, &[])),
            enabled,
        );
        Harness {
            store,
            writer,
            tracer,
            _dir: dir,
        }
    }

    fn event(ty: PipelineEventType, data: Value, ts: &str) -> PipelineEvent {
        PipelineEvent::new(ty, Some(data), ts)
    }

    #[test]
    fn event_type_names_are_kebab_case() {
        let ev: PipelineEvent =
            serde_json::from_value(json!({"type": "stt-end", "timestamp": "2024-06-01T00:00:00"})).unwrap();
        assert_eq!(ev.event_type, PipelineEventType::SttEnd);
        let ev: PipelineEvent =
            serde_json::from_value(json!({"type": "something-new", "timestamp": "x"})).unwrap();
        assert_eq!(ev.event_type, PipelineEventType::Other);
    }

    #[test]
    fn full_run_builds_trace_and_persists_it() {
        let h = harness(true);
        let run = "run-1";
        h.tracer
            .process(run, &event(PipelineEventType::RunStart, json!({}), "2024-06-01T10:00:00"))
            .unwrap();
        h.tracer
            .process(
                run,
                &event(
                    PipelineEventType::SttEnd,
                    json!({"stt_output": {"text": "turn on the kitchen light"}}),
                    "2024-06-01T10:00:00.400",
                ),
            )
            .unwrap();
        h.tracer
            .process(
                run,
                &event(
                    PipelineEventType::IntentEnd,
                    json!({"intent_output": {
                        "response": {"speech": {"plain": {"speech": "Turned on the light"}}},
                        "context": {"area": "kitchen"},
                        "entities": {"light.kitchen": {"state": "off"}}
                    }}),
                    "2024-06-01T10:00:01",
                ),
            )
            .unwrap();
        let trace = h
            .tracer
            .process(run, &PipelineEvent::new(PipelineEventType::RunEnd, None, "2024-06-01T10:00:01.250"))
            .unwrap()
            .unwrap();

        assert_eq!(trace.user_text.as_deref(), Some("turn on the kitchen light"));
        assert_eq!(trace.response_text, "Turned on the light");
        assert_eq!(trace.context["area"], "kitchen");
        assert!(trace.entities.contains_key("light.kitchen"));
        assert_eq!(trace.latency_ms, 1250);
        assert_eq!(trace.ha_events.len(), 4);
        assert_eq!(trace.ha_events[1]["type"], "stt-end");
        assert_eq!(h.store.get(run).unwrap().unwrap(), trace);

        let stats = h.writer.stop().unwrap();
        assert_eq!(stats.records_written, 1);
    }

    #[test]
    fn intent_speech_falls_back_to_text() {
        let h = harness(true);
        let trace = h
            .tracer
            .process(
                "r",
                &event(
                    PipelineEventType::IntentEnd,
                    json!({"intent_output": {"response": {"speech": {"plain": {"text": "ok"}}}}}),
                    "2024-06-01T10:00:00",
                ),
            )
            .unwrap()
            .unwrap();
        assert_eq!(trace.response_text, "ok");
        assert!(trace.context.is_empty());
    }

    #[test]
    fn unparseable_first_timestamp_is_rejected() {
        let h = harness(true);
        let err = h
            .tracer
            .process("r", &event(PipelineEventType::RunStart, json!({}), "yesterday"))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(h.store.get("r").unwrap().is_none());
    }

    #[test]
    fn disabled_tracer_ignores_events() {
        let h = harness(false);
        let out = h
            .tracer
            .process("r", &event(PipelineEventType::RunStart, json!({}), "2024-06-01T10:00:00"))
            .unwrap();
        assert!(out.is_none());
        assert!(h.store.is_empty().unwrap());
    }

    #[test]
    fn run_end_waits_for_room_in_a_full_queue() {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryTraceStore::new());
        let writer = Arc::new(TraceWriter::new(WriterConfig {
            queue_size: 1,
            ..WriterConfig::new(dir.path())
        }));
        let tracer = PipelineTracer::new(
            Arc::clone(&store) as Arc<dyn TraceStore>,
            Arc::clone(&writer),
            Arc::new(Redactor::new(RedactionLevel::None, &[])),
            true,
        );

        // Not started yet: the only slot stays taken until the consumer runs.
        let mut filler = AssistTrace::new("filler", parse_timestamp("2024-06-01T09:00:00").unwrap());
        filler.model = "m".to_string();
        writer.enqueue(filler).unwrap();

        std::thread::scope(|s| {
            let run = s.spawn(|| {
                tracer.on_event("run-1", &event(PipelineEventType::RunStart, json!({}), "2024-06-01T10:00:00"));
                tracer.on_event("run-1", &PipelineEvent::new(PipelineEventType::RunEnd, None, "2024-06-01T10:00:02"));
            });
            std::thread::sleep(Duration::from_millis(50));
            writer.start().unwrap();
            run.join().unwrap();
        });

        let stats = writer.stop().unwrap();
        assert_eq!(stats.records_written, 2);
        let path = dir.path().join("2024/06/01/model=unknown/part.jsonl.gz");
        let line = BufReader::new(MultiGzDecoder::new(File::open(path).unwrap()))
            .lines()
            .next()
            .unwrap()
            .unwrap();
        let persisted: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(persisted["trace_id"], "run-1");
        assert_eq!(persisted["latency_ms"], 2000);
    }

    #[test]
    fn run_end_reports_a_queue_that_stays_full() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(TraceWriter::new(WriterConfig {
            queue_size: 1,
            ..WriterConfig::new(dir.path())
        }));
        let tracer = PipelineTracer::new(
            Arc::new(InMemoryTraceStore::new()),
            Arc::clone(&writer),
            Arc::new(Redactor::new(RedactionLevel::None, &[])),
            true,
        )
        .with_run_end_timeout(Duration::from_millis(20));
        writer
            .enqueue(AssistTrace::new("filler", parse_timestamp("2024-06-01T09:00:00").unwrap()))
            .unwrap();

        let err = tracer
            .process("r", &PipelineEvent::new(PipelineEventType::RunEnd, None, "2024-06-01T10:00:00"))
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
