//! Deadline timer worker.
//!
//! One thread owns every armed timeout, ordered by deadline. Arming and
//! cancelling are messages on a bounded channel, so callers never wait on the
//! timer thread. Each entry is removed exactly once: when it is cancelled or
//! when it fires.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{at, bounded, never, select, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::{ExecutionError, TracesError, TracesResult};

const TIMER_QUEUE_CAPACITY: usize = 4096;

/// Orders timers by deadline; the token disambiguates equal deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TimerKey {
    pub deadline: Instant,
    pub token: u64,
}

#[derive(Debug)]
enum TimerMsg {
    Arm { key: TimerKey, trace_id: String },
    Disarm { key: TimerKey },
}

pub(crate) struct DeadlineTimer {
    tx: Mutex<Option<Sender<TimerMsg>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    armed: Arc<AtomicUsize>,
}

impl DeadlineTimer {
    /// Spawns the timer thread. `on_expire(trace_id, token)` runs on it.
    pub(crate) fn start<F>(on_expire: F) -> TracesResult<Self>
    where
        F: Fn(&str, u64) + Send + 'static,
    {
        let (tx, rx) = bounded::<TimerMsg>(TIMER_QUEUE_CAPACITY);
        let armed = Arc::new(AtomicUsize::new(0));
        let thread_armed = Arc::clone(&armed);
        let join = thread::Builder::new()
            .name("assist-traces-correlator".to_string())
            .spawn(move || run(&rx, &thread_armed, on_expire))
            .map_err(|e| TracesError::internal(format!("failed to spawn correlator timer: {e}")))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
            armed,
        })
    }

    /// Arms a timer. Waits for queue space rather than losing the timeout.
    pub(crate) fn arm(&self, key: TimerKey, trace_id: String) -> TracesResult<()> {
        let tx = self.sender().ok_or_else(disconnected)?;
        tx.send(TimerMsg::Arm { key, trace_id }).map_err(|_| disconnected())
    }

    /// Disarms a timer without blocking. A dropped disarm is harmless: the
    /// entry fires later and finds nothing to resolve.
    pub(crate) fn disarm(&self, key: TimerKey) {
        let Some(tx) = self.sender() else {
            return;
        };
        match tx.try_send(TimerMsg::Disarm { key }) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => warn!("correlator timer queue full; disarm deferred to deadline"),
        }
    }

    /// Timers currently armed on the worker.
    pub(crate) fn armed(&self) -> usize {
        self.armed.load(Ordering::Acquire)
    }

    /// Stops the worker. Armed timers are discarded without firing.
    pub(crate) fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handle = self.join.lock().ok().and_then(|mut j| j.take());
        if let Some(handle) = handle {
            // The on_expire callback may be what is dropping us; never self-join.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn sender(&self) -> Option<Sender<TimerMsg>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn disconnected() -> TracesError {
    ExecutionError::Disconnected {
        worker: "correlator_timer".to_string(),
    }
    .into()
}

fn run<F>(rx: &Receiver<TimerMsg>, armed: &AtomicUsize, on_expire: F)
where
    F: Fn(&str, u64),
{
    let mut timers: BTreeMap<TimerKey, String> = BTreeMap::new();

    loop {
        let now = Instant::now();
        while let Some(entry) = timers.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            let (key, trace_id) = entry.remove_entry();
            on_expire(&trace_id, key.token);
        }
        armed.store(timers.len(), Ordering::Release);

        let next_deadline = timers.keys().next().map_or_else(never, |key| at(key.deadline));
        select! {
            recv(rx) -> msg => match msg {
                Ok(TimerMsg::Arm { key, trace_id }) => {
                    timers.insert(key, trace_id);
                }
                Ok(TimerMsg::Disarm { key }) => {
                    timers.remove(&key);
                }
                Err(_) => break,
            },
            recv(next_deadline) -> _ => {}
        }
        armed.store(timers.len(), Ordering::Release);
    }

    debug!(discarded = timers.len(), "correlator timer stopped");
    armed.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    fn key(ms: u64, token: u64) -> TimerKey {
        TimerKey {
            deadline: Instant::now() + Duration::from_millis(ms),
            token,
        }
    }

    #[test]
    fn fires_in_deadline_order() {
        let (tx, rx) = mpsc::channel();
        let timer = DeadlineTimer::start(move |id, token| {
            let _ = tx.send((id.to_string(), token));
        })
        .unwrap();

        timer.arm(key(60, 2), "late".to_string()).unwrap();
        timer.arm(key(10, 1), "early".to_string()).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, ("early".to_string(), 1));
        assert_eq!(second, ("late".to_string(), 2));
        timer.shutdown();
        assert_eq!(timer.armed(), 0);
    }

    #[test]
    fn disarmed_timer_never_fires() {
        let (tx, rx) = mpsc::channel();
        let timer = DeadlineTimer::start(move |id, _| {
            let _ = tx.send(id.to_string());
        })
        .unwrap();

        let k = key(30, 7);
        timer.arm(k, "t".to_string()).unwrap();
        timer.disarm(k);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert_eq!(timer.armed(), 0);
    }

    #[test]
    fn shutdown_discards_armed_timers() {
        let (tx, rx) = mpsc::channel();
        let timer = DeadlineTimer::start(move |id, _| {
            let _ = tx.send(id.to_string());
        })
        .unwrap();
        timer.arm(key(50, 1), "t".to_string()).unwrap();
        timer.shutdown();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert!(timer.arm(key(1, 2), "u".to_string()).is_err());
    }
}
