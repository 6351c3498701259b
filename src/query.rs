//! Read-only views over the trace store.

use std::collections::BTreeMap;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

use crate::error::TracesResult;
use crate::storage::TraceStore;
use crate::time::Timestamp;
use crate::trace::{AssistTrace, TraceOutcome};

/// Default number of traces returned by `preview_recent`.
pub const DEFAULT_PREVIEW_LIMIT: usize = 25;

/// Outcome counts and mean latency over every held trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStats {
    /// Traces per `result` value. Only values that occur are listed.
    pub counts: BTreeMap<String, usize>,
    /// Mean `latency_ms`, 0 when no traces are held.
    pub mean_latency_ms: f64,
}

/// Rolling 24-hour telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSensors {
    /// Traces whose `ts` falls in the last 24 hours.
    pub count_24h: usize,
    /// Share of those traces that failed.
    pub fail_rate_24h: f64,
    /// Mean latency of those traces.
    pub mean_latency_ms_24h: f64,
}

/// The `limit` most recently inserted traces, oldest first.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn preview_recent(store: &dyn TraceStore, limit: usize) -> TracesResult<Vec<AssistTrace>> {
    Ok(store.recent(limit)?)
}

/// One trace, or `None` if the id is unknown.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn trace_by_id(store: &dyn TraceStore, trace_id: &str) -> TracesResult<Option<AssistTrace>> {
    Ok(store.get(trace_id)?)
}

/// Counts by outcome plus mean latency across all held traces.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn stats(store: &dyn TraceStore) -> TracesResult<TraceStats> {
    let traces = store.snapshot()?;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for trace in &traces {
        *counts.entry(trace.result.as_str().to_string()).or_default() += 1;
    }
    Ok(TraceStats {
        counts,
        mean_latency_ms: mean_latency(&traces),
    })
}

/// Telemetry over traces with `ts` at or after `now - 24h`.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn sensors(store: &dyn TraceStore, now: Timestamp) -> TracesResult<TraceSensors> {
    let cutoff = now - ChronoDuration::hours(24);
    let recent: Vec<AssistTrace> = store.snapshot()?.into_iter().filter(|t| t.ts >= cutoff).collect();
    let failed = recent.iter().filter(|t| t.result == TraceOutcome::Fail).count();
    let denom = recent.len().max(1) as f64;
    Ok(TraceSensors {
        count_24h: recent.len(),
        fail_rate_24h: failed as f64 / denom,
        mean_latency_ms_24h: mean_latency(&recent),
    })
}

fn mean_latency(traces: &[AssistTrace]) -> f64 {
    if traces.is_empty() {
        return 0.0;
    }
    let total: u64 = traces.iter().map(|t| t.latency_ms).sum();
    total as f64 / traces.len() as f64
}
