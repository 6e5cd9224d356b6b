//! Per-channel subscription table: event key → ordered handler list.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::message::EventHead;

/// An event handler. Identity is the `Arc` allocation: register and
/// unregister with clones of the same handle.
pub type EventHandler = Arc<dyn Fn(&EventHead, &[Value]) + Send + Sync>;

/// Maps event keys to handlers in registration order, without duplicates.
#[derive(Default)]
pub struct SubscriptionTable {
    handlers: HashMap<String, Vec<EventHandler>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` under `key`. Returns `false` if that exact handler is
    /// already registered for the key.
    pub fn add(&mut self, key: &str, handler: &EventHandler) -> bool {
        let entry = self.handlers.entry(key.to_string()).or_default();
        if entry.iter().any(|h| Arc::ptr_eq(h, handler)) {
            debug!("Duplicate registration for event '{key}'");
            return false;
        }
        entry.push(Arc::clone(handler));
        debug!("Registered handler #{} for event '{key}'", entry.len());
        true
    }

    /// Remove `handler` from `key`, dropping the key with its last handler.
    /// Returns `false` if the key or the handler was not registered.
    pub fn remove(&mut self, key: &str, handler: &EventHandler) -> bool {
        let Some(entry) = self.handlers.get_mut(key) else {
            debug!("No handlers to unregister for event '{key}'");
            return false;
        };
        let before = entry.len();
        entry.retain(|h| !Arc::ptr_eq(h, handler));
        if entry.len() == before {
            debug!("Handler not registered for event '{key}'");
            return false;
        }
        if entry.is_empty() {
            self.handlers.remove(key);
        }
        debug!("Unregistered handler for event '{key}'");
        true
    }

    /// Snapshot of the handlers for `key`, so they can run without the lock.
    pub fn snapshot(&self, key: &str) -> Option<Vec<EventHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn count(&self, key: &str) -> usize {
        self.handlers.get(key).map_or(0, Vec::len)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    /// Number of keys with at least one handler.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Run every handler in order. A panicking handler is logged and the rest
/// still run.
pub fn invoke(handlers: &[EventHandler], head: &EventHead, params: &[Value]) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(head, params))).is_err() {
            warn!("Handler for event '{}' panicked", head.key);
        }
    }
}
