//! In-memory trace store.
//!
//! The id index sits behind one `RwLock`; each record sits behind its own
//! `Mutex`. Lookups take the index read lock only long enough to clone the
//! record handle, so a slow mutation of one trace never blocks another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::TracesResult;
use crate::storage::traits::{StorageError, TraceStore};
use crate::trace::AssistTrace;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

type Slot = Arc<Mutex<AssistTrace>>;

#[derive(Debug, Default)]
struct StoreState {
    by_id: HashMap<String, Slot>,
    /// Insertion order of live ids.
    order: Vec<String>,
}

impl StoreState {
    fn insert(&mut self, trace: AssistTrace) -> Slot {
        let id = trace.trace_id.clone();
        let slot = Arc::new(Mutex::new(trace));
        self.by_id.insert(id.clone(), Arc::clone(&slot));
        self.order.push(id);
        slot
    }
}

/// Thread-safe in-memory trace store.
#[derive(Debug, Default)]
pub struct InMemoryTraceStore {
    state: RwLock<StoreState>,
}

impl InMemoryTraceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, trace_id: &str) -> Result<Option<Slot>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trace.slot"))?;
        Ok(state.by_id.get(trace_id).cloned())
    }

    fn read_slot(slot: &Slot, context: &'static str) -> Result<AssistTrace, StorageError> {
        slot.lock().map(|t| t.clone()).map_err(|_| lock_err(context))
    }

    fn collect(&self, limit: Option<usize>) -> Result<Vec<AssistTrace>, StorageError> {
        let slots: Vec<Slot> = {
            let state = self.state.read().map_err(|_| lock_err("trace.collect"))?;
            let skip = limit.map_or(0, |n| state.order.len().saturating_sub(n));
            state
                .order
                .iter()
                .skip(skip)
                .filter_map(|id| state.by_id.get(id).cloned())
                .collect()
        };
        slots.iter().map(|s| Self::read_slot(s, "trace.collect")).collect()
    }
}

impl TraceStore for InMemoryTraceStore {
    fn insert(&self, trace: AssistTrace) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("trace.insert"))?;
        if state.by_id.contains_key(&trace.trace_id) {
            return Err(StorageError::DuplicateKey(trace.trace_id));
        }
        state.insert(trace);
        Ok(())
    }

    fn get(&self, trace_id: &str) -> Result<Option<AssistTrace>, StorageError> {
        match self.slot(trace_id)? {
            Some(slot) => Self::read_slot(&slot, "trace.get").map(Some),
            None => Ok(None),
        }
    }

    fn update(&self, trace_id: &str, apply: &mut dyn FnMut(&mut AssistTrace)) -> Result<bool, StorageError> {
        let Some(slot) = self.slot(trace_id)? else {
            return Ok(false);
        };
        let mut trace = slot.lock().map_err(|_| lock_err("trace.update"))?;
        apply(&mut trace);
        Ok(true)
    }

    fn upsert_with(
        &self,
        trace_id: &str,
        create: &mut dyn FnMut() -> TracesResult<AssistTrace>,
        apply: &mut dyn FnMut(&mut AssistTrace) -> TracesResult<()>,
    ) -> TracesResult<(AssistTrace, bool)> {
        let existing = match self.slot(trace_id)? {
            Some(slot) => slot,
            None => {
                let mut state = self.state.write().map_err(|_| lock_err("trace.upsert"))?;
                // Another writer may have created it between the two locks.
                if let Some(slot) = state.by_id.get(trace_id).cloned() {
                    slot
                } else {
                    let trace = create()?;
                    if trace.trace_id != trace_id {
                        return Err(StorageError::BackendError(format!(
                            "created trace '{}' under id '{trace_id}'",
                            trace.trace_id
                        ))
                        .into());
                    }
                    let stored = trace.clone();
                    state.insert(trace);
                    return Ok((stored, true));
                }
            }
        };

        let mut trace = existing.lock().map_err(|_| lock_err("trace.upsert"))?;
        apply(&mut trace)?;
        Ok((trace.clone(), false))
    }

    fn remove(&self, trace_id: &str) -> Result<Option<AssistTrace>, StorageError> {
        let slot = {
            let mut state = self.state.write().map_err(|_| lock_err("trace.remove"))?;
            let Some(slot) = state.by_id.remove(trace_id) else {
                return Ok(None);
            };
            state.order.retain(|id| id != trace_id);
            slot
        };
        Self::read_slot(&slot, "trace.remove").map(Some)
    }

    fn recent(&self, limit: usize) -> Result<Vec<AssistTrace>, StorageError> {
        self.collect(Some(limit))
    }

    fn snapshot(&self) -> Result<Vec<AssistTrace>, StorageError> {
        self.collect(None)
    }

    fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trace.len"))?;
        Ok(state.by_id.len())
    }
}
