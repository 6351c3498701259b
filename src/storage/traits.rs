//! Abstract storage contract for traces.
//!
//! Every mutation goes through a method that holds the per-trace lock for its
//! whole duration, so concurrent readers never observe a half-applied merge.
//! Different trace ids never contend with each other.

use thiserror::Error;

use crate::error::TracesResult;
use crate::trace::{AssistTrace, TraceOutcome};

/// Errors that can occur during trace store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key already exists.
    #[error("Duplicate trace id: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Trace store backend error: {0}")]
    BackendError(String),
}

/// Storage trait for trace records.
pub trait TraceStore: Send + Sync {
    /// Insert a new trace. Returns error if the id already exists.
    fn insert(&self, trace: AssistTrace) -> Result<(), StorageError>;

    /// Get a copy of a trace by id.
    fn get(&self, trace_id: &str) -> Result<Option<AssistTrace>, StorageError>;

    /// Mutate a trace in place. Returns false if the id is unknown.
    fn update(&self, trace_id: &str, apply: &mut dyn FnMut(&mut AssistTrace)) -> Result<bool, StorageError>;

    /// Create-or-mutate as one atomic step.
    ///
    /// If the id is unknown, `create` builds the record that gets inserted and
    /// `apply` is not called. Otherwise `apply` runs under the trace lock and an
    /// error from it is returned unchanged. Returns the stored record and
    /// whether it was created.
    fn upsert_with(
        &self,
        trace_id: &str,
        create: &mut dyn FnMut() -> TracesResult<AssistTrace>,
        apply: &mut dyn FnMut(&mut AssistTrace) -> TracesResult<()>,
    ) -> TracesResult<(AssistTrace, bool)>;

    /// Remove a trace. Returns the removed record, if any.
    fn remove(&self, trace_id: &str) -> Result<Option<AssistTrace>, StorageError>;

    /// The `limit` most recently inserted traces, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<AssistTrace>, StorageError>;

    /// All traces in insertion order.
    fn snapshot(&self) -> Result<Vec<AssistTrace>, StorageError>;

    /// Number of traces held.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if no traces are held.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Moves a trace from `unknown` to `outcome`.
    ///
    /// Returns true only if the trace exists and was still unresolved; a
    /// terminal result is never rewritten.
    fn set_result(&self, trace_id: &str, outcome: TraceOutcome) -> Result<bool, StorageError> {
        let mut applied = false;
        let found = self.update(trace_id, &mut |trace| {
            if !trace.result.is_terminal() {
                trace.result = outcome;
                applied = true;
            }
        })?;
        Ok(found && applied)
    }
}
