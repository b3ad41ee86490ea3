//! Per-session event handler registry.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::warn;

use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "channel::handlers";

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies a registered handler so it can be removed with
/// [`EventChannel::off`](super::EventChannel::off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handlers by event name, in registration order.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
}

impl HandlerRegistry {
    pub(crate) fn add(&self, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId::next();
        rw_write(&self.handlers, SOURCE, "add")
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = rw_write(&self.handlers, SOURCE, "remove");
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(handler_id, _)| *handler_id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub(crate) fn clear(&self) {
        rw_write(&self.handlers, SOURCE, "clear").clear();
    }

    /// Runs every handler for `event`; returns how many ran.
    ///
    /// Handlers are invoked outside the lock so they may register or remove
    /// handlers themselves.
    pub(crate) fn dispatch(&self, event: &str, data: &Value) -> usize {
        let targets: Vec<EventHandler> = rw_read(&self.handlers, SOURCE, "dispatch")
            .get(event)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        for handler in &targets {
            if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
                warn!(event, "Event handler panicked");
            }
        }
        targets.len()
    }

    pub(crate) fn len(&self) -> usize {
        rw_read(&self.handlers, SOURCE, "len")
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> EventHandler {
        let log = Arc::clone(log);
        Arc::new(move |data: &Value| {
            log.lock()
                .expect("log lock")
                .push(format!("{label}:{data}"));
        })
    }

    #[test]
    fn dispatch_runs_in_registration_order() {
        let registry = HandlerRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add("notification", recorder(&log, "first"));
        registry.add("notification", recorder(&log, "second"));
        registry.add("other", recorder(&log, "other"));

        let ran = registry.dispatch("notification", &json!(1));

        assert_eq!(ran, 2);
        assert_eq!(*log.lock().expect("log lock"), vec!["first:1", "second:1"]);
    }

    #[test]
    fn remove_and_clear() {
        let registry = HandlerRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = registry.add("notification", recorder(&log, "a"));
        registry.add("notification", recorder(&log, "b"));

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert_eq!(registry.dispatch("notification", &json!(null)), 0);
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let registry = Arc::new(HandlerRegistry::default());
        let inner = Arc::clone(&registry);
        registry.add(
            "notification",
            Arc::new(move |_: &Value| {
                inner.add("notification", Arc::new(|_: &Value| {}));
            }),
        );

        registry.dispatch("notification", &json!({}));
        assert_eq!(registry.len(), 2);
    }

    fn explode(_: &Value) {
        panic!("handler bug");
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let registry = HandlerRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add("notification", Arc::new(explode));
        registry.add("notification", recorder(&log, "after"));

        assert_eq!(registry.dispatch("notification", &json!(2)), 2);
        assert_eq!(*log.lock().expect("log lock"), vec!["after:2"]);
    }
}
