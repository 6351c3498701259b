//! Host collaborator contracts.
//!
//! The host runtime owns the event stream. Components that need to observe it
//! register a handler once and keep the returned `ListenerId` so they can
//! release the subscription on teardown. `LocalEventBus` is the in-process
//! implementation used by the CLI host and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type fired when an entity changes state.
pub const EVENT_STATE_CHANGED: &str = "state_changed";

/// One event on the host bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Event type, e.g. `state_changed`.
    pub event_type: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl BusEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// A `state_changed` event for one entity.
    #[must_use]
    pub fn state_changed(entity_id: impl Into<String>) -> Self {
        Self::new(
            EVENT_STATE_CHANGED,
            serde_json::json!({ "entity_id": entity_id.into() }),
        )
    }

    /// The `entity_id` carried in the payload, if any.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        self.data.get("entity_id").and_then(Value::as_str)
    }
}

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Handler invoked synchronously for each matching event. Must not block.
pub type EventHandler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Observer registration interface exposed by the host.
pub trait EventBus: Send + Sync {
    /// Registers `handler` for events of `event_type`.
    fn listen(&self, event_type: &str, handler: EventHandler) -> ListenerId;

    /// Releases a listener. Returns false if it was not registered.
    fn unlisten(&self, id: ListenerId) -> bool;
}

/// In-process event bus delivering events on the firing thread.
#[derive(Default)]
pub struct LocalEventBus {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<ListenerId, (String, EventHandler)>>,
}

impl std::fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl LocalEventBus {
    /// Creates a bus with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every listener of its type. Returns the number of
    /// handlers invoked.
    pub fn fire(&self, event: &BusEvent) -> usize {
        // Handlers run outside the lock so they may (un)register listeners.
        let handlers: Vec<EventHandler> = match self.listeners.read() {
            Ok(listeners) => listeners
                .values()
                .filter(|(ty, _)| *ty == event.event_type)
                .map(|(_, h)| Arc::clone(h))
                .collect(),
            Err(_) => return 0,
        };
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().map_or(0, |l| l.len())
    }
}

impl EventBus for LocalEventBus {
    fn listen(&self, event_type: &str, handler: EventHandler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.insert(id, (event_type.to_string(), handler));
        }
        id
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        self.listeners
            .write()
            .map(|mut l| l.remove(&id).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn delivers_only_matching_event_types() {
        let bus = LocalEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.listen(
            EVENT_STATE_CHANGED,
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(bus.fire(&BusEvent::state_changed("light.kitchen")), 1);
        assert_eq!(bus.fire(&BusEvent::new("call_service", Value::Null)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unlisten_releases_handler() {
        let bus = LocalEventBus::new();
        let id = bus.listen(EVENT_STATE_CHANGED, Arc::new(|_| {}));
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unlisten(id));
        assert!(!bus.unlisten(id));
        assert_eq!(bus.fire(&BusEvent::state_changed("x")), 0);
    }

    #[test]
    fn entity_id_is_read_from_payload() {
        assert_eq!(BusEvent::state_changed("light.a").entity_id(), Some("light.a"));
        assert_eq!(BusEvent::new(EVENT_STATE_CHANGED, Value::Null).entity_id(), None);
    }
}
