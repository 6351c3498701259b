//! Trace storage.
//!
//! The trace store is the shared ground truth: ingestion, pipeline tracing, the
//! correlator and feedback all mutate records through it, and the query layer
//! reads from it. `TraceStore` is the contract; `InMemoryTraceStore` is the
//! process-local implementation.

mod memory;
mod traits;

pub use memory::InMemoryTraceStore;
pub use traits::{StorageError, TraceStore};
