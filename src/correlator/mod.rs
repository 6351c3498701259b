//! Outcome correlator.
//!
//! Each watched trace races a confirming `state_changed` event against a fixed
//! window. The pending map is the single mutation point: whichever path removes
//! a watch from it (event, timeout, or cancellation) is the only one allowed to
//! act on that watch, and it does so exactly once.
//!
//! Timeouts live on one timer thread (see [`timer`]). Event intake runs on the
//! bus thread and never blocks on the timer.

mod timer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::TracesConfig;
use crate::error::{ExecutionError, TracesError, TracesResult};
use crate::host::{BusEvent, EventBus, ListenerId, EVENT_STATE_CHANGED};
use crate::storage::TraceStore;
use crate::trace::TraceOutcome;

use timer::{DeadlineTimer, TimerKey};

/// Correlator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// How long a watch waits for a confirming event before failing.
    pub window: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
        }
    }
}

impl From<&TracesConfig> for CorrelatorConfig {
    fn from(cfg: &TracesConfig) -> Self {
        Self {
            window: cfg.correlation_window(),
        }
    }
}

#[derive(Debug)]
struct Watch {
    entities: Vec<String>,
    key: TimerKey,
}

struct Shared {
    store: Arc<dyn TraceStore>,
    pending: Mutex<HashMap<String, Watch>>,
    timer: OnceLock<DeadlineTimer>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, Watch>> {
        // A poisoned map only means a panicking thread held it; the entries
        // themselves are still consistent.
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn disarm(&self, key: TimerKey) {
        if let Some(timer) = self.timer.get() {
            timer.disarm(key);
        }
    }

    /// Timeout path. Applies only if the watch with this token is still pending.
    fn expire(&self, trace_id: &str, token: u64) -> bool {
        let removed = {
            let mut pending = self.pending();
            match pending.get(trace_id) {
                Some(watch) if watch.key.token == token => pending.remove(trace_id),
                _ => None,
            }
        };
        if removed.is_none() {
            return false;
        }
        self.resolve(trace_id, TraceOutcome::Fail);
        true
    }

    fn resolve(&self, trace_id: &str, outcome: TraceOutcome) {
        match self.store.set_result(trace_id, outcome) {
            Ok(true) => debug!(trace_id, outcome = outcome.as_str(), "trace resolved"),
            Ok(false) => debug!(trace_id, outcome = outcome.as_str(), "resolution skipped; trace missing or resolved"),
            Err(e) => warn!(trace_id, error = %e, "failed to record trace outcome"),
        }
    }
}

/// Resolves trace outcomes from host state changes.
pub struct Correlator {
    shared: Arc<Shared>,
    bus: Arc<dyn EventBus>,
    listener: Mutex<Option<ListenerId>>,
    next_token: AtomicU64,
    window: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("window", &self.window)
            .field("pending", &self.pending_count())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Correlator {
    /// Creates a correlator and subscribes it to `state_changed` on `bus`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer thread cannot be spawned.
    pub fn new(store: Arc<dyn TraceStore>, bus: Arc<dyn EventBus>, cfg: CorrelatorConfig) -> TracesResult<Self> {
        let shared = Arc::new(Shared {
            store,
            pending: Mutex::new(HashMap::new()),
            timer: OnceLock::new(),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let timer = DeadlineTimer::start(move |trace_id, token| {
            if let Some(shared) = weak.upgrade() {
                shared.expire(trace_id, token);
            }
        })?;
        if shared.timer.set(timer).is_err() {
            return Err(TracesError::internal("correlator timer initialized twice"));
        }

        let weak = Arc::downgrade(&shared);
        let listener = bus.listen(
            EVENT_STATE_CHANGED,
            Arc::new(move |event: &BusEvent| {
                if let Some(shared) = weak.upgrade() {
                    match_event(&shared, event);
                }
            }),
        );

        Ok(Self {
            shared,
            bus,
            listener: Mutex::new(Some(listener)),
            next_token: AtomicU64::new(1),
            window: cfg.window,
            closed: AtomicBool::new(false),
        })
    }

    fn timer(&self) -> TracesResult<&DeadlineTimer> {
        self.shared
            .timer
            .get()
            .ok_or_else(|| TracesError::internal("correlator timer not initialized"))
    }

    /// Registers a watch for `trace_id` on `entity_ids`.
    ///
    /// A watch already held for the same trace is replaced and its timeout
    /// cancelled. With no entity ids the watch can only time out.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` after shutdown.
    pub fn add_trace(&self, trace_id: &str, entity_ids: Vec<String>) -> TracesResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutionError::Disconnected {
                worker: "correlator".to_string(),
            }
            .into());
        }

        let key = TimerKey {
            deadline: Instant::now() + self.window,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        };
        let replaced = self.shared.pending().insert(
            trace_id.to_string(),
            Watch {
                entities: entity_ids,
                key,
            },
        );
        if let Some(old) = replaced {
            self.shared.disarm(old.key);
            debug!(trace_id, "replaced correlator watch");
        }

        if let Err(e) = self.timer().and_then(|t| t.arm(key, trace_id.to_string())) {
            self.shared.pending().remove(trace_id);
            return Err(e);
        }
        debug!(trace_id, window_ms = self.window.as_millis() as u64, "watching trace");
        Ok(())
    }

    /// Runs event intake for one bus event. Returns the number of traces it
    /// resolved.
    pub fn handle_event(&self, event: &BusEvent) -> usize {
        match_event(&self.shared, event)
    }

    /// Resolves a pending watch as failed right away, as if its window had
    /// elapsed. Returns false if the trace was not pending.
    pub fn expire(&self, trace_id: &str) -> bool {
        let Some(key) = self.shared.pending().get(trace_id).map(|w| w.key) else {
            return false;
        };
        let expired = self.shared.expire(trace_id, key.token);
        if expired {
            self.shared.disarm(key);
        }
        expired
    }

    /// Drops a pending watch without recording an outcome.
    pub fn cancel(&self, trace_id: &str) -> bool {
        let Some(watch) = self.shared.pending().remove(trace_id) else {
            return false;
        };
        self.shared.disarm(watch.key);
        true
    }

    /// Number of traces still being watched.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Returns true if `trace_id` has a pending watch.
    #[must_use]
    pub fn is_watching(&self, trace_id: &str) -> bool {
        self.shared.pending().contains_key(trace_id)
    }

    /// Entity ids watched for `trace_id`.
    #[must_use]
    pub fn watched_entities(&self, trace_id: &str) -> Option<Vec<String>> {
        self.shared.pending().get(trace_id).map(|w| w.entities.clone())
    }

    /// Timeouts currently armed on the timer thread.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.shared.timer.get().map_or(0, DeadlineTimer::armed)
    }

    /// The correlation window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Releases the bus subscription, cancels every timeout and clears the
    /// watch set. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let listener = self.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(id) = listener {
            self.bus.unlisten(id);
        }
        if let Some(timer) = self.shared.timer.get() {
            timer.shutdown();
        }
        let dropped = {
            let mut pending = self.shared.pending();
            let n = pending.len();
            pending.clear();
            n
        };
        debug!(dropped, "correlator shut down");
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Removes every watch whose entity set contains the event's entity, records
/// success for each and cancels their timeouts. Returns how many resolved.
fn match_event(shared: &Shared, event: &BusEvent) -> usize {
    if event.event_type != EVENT_STATE_CHANGED {
        return 0;
    }
    let Some(entity_id) = event.entity_id() else {
        return 0;
    };

    let resolved: Vec<(String, TimerKey)> = {
        let mut pending = shared.pending();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, w)| w.entities.iter().any(|e| e == entity_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|w| (id, w.key)))
            .collect()
    };

    for (trace_id, key) in &resolved {
        shared.disarm(*key);
        shared.resolve(trace_id, TraceOutcome::Success);
    }
    resolved.len()
}
