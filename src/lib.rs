//! # assist_traces
//!
//! Captures, correlates, redacts and persists traces of conversational
//! assistant pipeline runs, and turns them into fine-tuning datasets.
//!
//! ## Core Concepts
//!
//! - **Trace**: one assistant turn, from input through response to its outcome
//! - **Writer**: a bounded queue drained by one thread into gzip JSONL segments,
//!   partitioned by date and model and rotated by size
//! - **Correlator**: races each trace's target entities against a fixed window;
//!   a matching state change means `success`, silence means `fail`
//! - **Service**: the context object the host holds; it owns the store, the
//!   writer and the correlator and implements every command
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use assist_traces::{BusEvent, LocalEventBus, TraceService, TracesConfig};
//! use serde_json::json;
//!
//! let bus = Arc::new(LocalEventBus::new());
//! let service = TraceService::setup(TracesConfig::default(), bus.clone())?;
//!
//! service.log_event(json!({
//!     "trace_id": "t1",
//!     "ts": "2024-06-01T00:00:00",
//!     "model": "m",
//!     "parsed_action": {"target": {"entity_id": "light.kitchen"}}
//! }))?;
//! bus.fire(&BusEvent::state_changed("light.kitchen"));
//!
//! let stats = service.unload()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod time;
pub mod trace;

// Storage and background workers
pub mod correlator;
pub mod storage;
pub mod writer;

// Host surface and commands
pub mod export;
pub mod host;
pub mod pipeline;
pub mod query;
pub mod redact;
pub mod service;

// Re-export primary types at crate root for convenience
pub use config::{Partitioning, RedactionLevel, TracesConfig};
pub use correlator::{Correlator, CorrelatorConfig};
pub use error::{ExecutionError, TracesError, TracesResult, ValidationError};
pub use export::{DedupMode, ExportSummary};
pub use host::{BusEvent, EventBus, EventHandler, ListenerId, LocalEventBus, EVENT_STATE_CHANGED};
pub use pipeline::{PipelineEvent, PipelineEventType, PipelineObserver, PipelineTracer};
pub use query::{TraceSensors, TraceStats};
pub use redact::Redactor;
pub use service::{Diagnostics, FeedbackUpdate, TraceService};
pub use storage::{InMemoryTraceStore, StorageError, TraceStore};
pub use time::Timestamp;
pub use trace::{AssistTrace, ToolCall, TraceOutcome, TruncationInfo};
pub use writer::{TraceWriter, WriterConfig, WriterStats};
