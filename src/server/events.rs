use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use dashmap::DashMap;
use tracing::error;

/// Payload delivered to event handlers.
pub type Payload = serde_json::Value;

/// A callback bound to a named event.
pub type Handler = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Fired once on a channel when it leaves the broker.
pub const DISCONNECT_EVENT: &str = "disconnect";
/// Fired on the listener when a channel has been admitted.
pub const CONNECTION_EVENT: &str = "connection";
/// Fired on the listener once it accepts connections.
pub const LISTENING_EVENT: &str = "listening";
/// Fired on the listener after a completed TLS handshake.
pub const SECURE_CONNECTION_EVENT: &str = "secureConnection";
/// Fired on the listener when a TLS handshake fails or is rejected.
pub const TLS_CLIENT_ERROR_EVENT: &str = "tlsClientError";
/// Fired on the listener for non-fatal lifecycle failures.
pub const ERROR_EVENT: &str = "error";
/// Fired on the listener after it stopped accepting.
pub const CLOSE_EVENT: &str = "close";

/// Wraps a closure into a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Payload) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
struct Registration {
    handler: Handler,
    once: bool,
}

/// Named-event handler table.
///
/// Handlers run outside the table lock, so a handler may register further
/// handlers. A panicking handler is logged and does not affect the others.
#[derive(Default)]
pub struct EventHandlers {
    handlers: DashMap<String, Vec<Registration>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `handler` to `event` for every future emission.
    pub fn on(&self, event: &str, handler: Handler) {
        self.register(event, handler, false);
    }

    /// Attaches `handler` to `event` for the next emission only.
    pub fn once(&self, event: &str, handler: Handler) {
        self.register(event, handler, true);
    }

    fn register(&self, event: &str, handler: Handler, once: bool) {
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push(Registration { handler, once });
    }

    /// Invokes the handlers bound to `event` in registration order and returns
    /// how many ran.
    pub fn emit(&self, event: &str, payload: &Payload) -> usize {
        let due: Vec<Handler> = match self.handlers.get_mut(event) {
            Some(mut entry) => {
                let due = entry.iter().map(|r| r.handler.clone()).collect();
                entry.retain(|r| !r.once);
                due
            }
            None => return 0,
        };

        for handler in &due {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                error!("Handler for event '{}' panicked; ignoring", event);
            }
        }
        due.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.handlers.get(event).map(|entry| entry.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Handler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn on_handlers_fire_every_time() {
        let events = EventHandlers::new();
        let (count, h) = counter();
        events.on("tick", h);

        events.emit("tick", &json!(null));
        events.emit("tick", &json!(null));
        events.emit("other", &json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_handlers_fire_once() {
        let events = EventHandlers::new();
        let (count, h) = counter();
        events.once(DISCONNECT_EVENT, h);

        assert_eq!(events.emit(DISCONNECT_EVENT, &json!({})), 1);
        assert_eq!(events.emit(DISCONNECT_EVENT, &json!({})), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(events.listener_count(DISCONNECT_EVENT), 0);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let events = EventHandlers::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            events.on("e", handler(move |_| order.lock().unwrap().push(i)));
        }
        events.emit("e", &json!(null));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let events = EventHandlers::new();
        let (count, h) = counter();
        events.on("e", handler(|_| panic!("boom")));
        events.on("e", h);

        assert_eq!(events.emit("e", &json!(null)), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_register_more_handlers() {
        let events = Arc::new(EventHandlers::new());
        let inner = events.clone();
        events.once(
            "e",
            handler(move |_| inner.on("late", handler(|_| {}))),
        );
        events.emit("e", &json!(null));
        assert_eq!(events.listener_count("late"), 1);
    }
}
