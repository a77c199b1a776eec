//! Event listener registry with stable removal handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

/// Callback invoked with the sender's context and the event params.
pub type Listener<C> = Arc<dyn Fn(C, Vec<Value>) + Send + Sync>;

/// Handle returned by [`ListenerRegistry::on`], used to remove that listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Multi-subscriber registry keyed by event name.
pub struct ListenerRegistry<C> {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener<C>)>>>,
    next_id: AtomicU64,
}

impl<C: Clone> ListenerRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Add a listener for `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(C, Vec<Value>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(event.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove one listener. Returns `true` if it was registered under `event`.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            let _ = listeners.remove(event);
        }
        removed
    }

    /// Invoke every listener registered for `event`.
    ///
    /// Returns the number of listeners invoked; unmatched events are dropped.
    /// Listeners run outside the registry lock, so they may add or remove
    /// listeners themselves.
    pub fn emit(&self, ctx: &C, event: &str, params: &[Value]) -> usize {
        let targets: Vec<Listener<C>> = self
            .listeners
            .read()
            .get(event)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        if targets.is_empty() {
            trace!(event, "no listeners for event");
        }
        for listener in &targets {
            listener(ctx.clone(), params.to_vec());
        }
        targets.len()
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }
}

impl<C: Clone> Default for ListenerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn emit_reaches_all_listeners() {
        let reg = ListenerRegistry::<u8>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            let _ = reg.on("onMessage", move |ctx, params| {
                seen.lock().push((tag, ctx, params));
            });
        }
        let invoked = reg.emit(&3, "onMessage", &[json!("room1"), json!("hi")]);
        assert_eq!(invoked, 2);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, ctx, p)| *ctx == 3 && p == &vec![json!("room1"), json!("hi")]));
    }

    #[test]
    fn unmatched_event_is_dropped() {
        let reg = ListenerRegistry::<()>::new();
        assert_eq!(reg.emit(&(), "nobody", &[]), 0);
    }

    #[test]
    fn off_removes_only_that_listener() {
        let reg = ListenerRegistry::<()>::new();
        let hits = Arc::new(Mutex::new(0));
        let h1 = hits.clone();
        let first = reg.on("tick", move |(), _| *h1.lock() += 1);
        let h2 = hits.clone();
        let _second = reg.on("tick", move |(), _| *h2.lock() += 10);

        assert!(reg.off("tick", first));
        assert_eq!(reg.listener_count("tick"), 1);
        let _ = reg.emit(&(), "tick", &[]);
        assert_eq!(*hits.lock(), 10);
    }

    #[test]
    fn off_unknown_is_false() {
        let reg = ListenerRegistry::<()>::new();
        let id = reg.on("a", |(), _| {});
        assert!(!reg.off("b", id));
        assert!(reg.off("a", id));
        assert!(!reg.off("a", id));
        assert_eq!(reg.listener_count("a"), 0);
    }

    #[test]
    fn listener_may_register_during_emit() {
        let reg = Arc::new(ListenerRegistry::<()>::new());
        let inner = reg.clone();
        let _ = reg.on("grow", move |(), _| {
            let _ = inner.on("grow", |(), _| {});
        });
        assert_eq!(reg.emit(&(), "grow", &[]), 1);
        assert_eq!(reg.listener_count("grow"), 2);
    }
}
