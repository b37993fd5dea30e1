//! Event bus: a publish/subscribe registry keyed by event kind.
//!
//! Design intent:
//! - Handler invocation is synchronous and in registration order; the bus
//!   introduces no parallelism of its own.
//! - A panicking handler is isolated: later handlers still run and the
//!   emitter never observes the panic (log-and-continue).

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};

use std::sync::Arc;

use crate::domain::{Event, EventKind};

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Capability to remove exactly one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler; the returned subscription removes exactly this
    /// registration.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    /// Remove one registration; no-op if it is already gone.
    pub fn off(&self, sub: Subscription) {
        let mut state = self.lock();
        if let Some(handlers) = state.handlers.get_mut(&sub.kind) {
            handlers.retain(|(id, _)| *id != sub.id);
        }
    }

    /// Invoke every handler registered for the event's kind, in
    /// registration order. Panics are contained per handler.
    pub fn emit(&self, event: &Event) {
        // Snapshot outside the lock so handlers may re-enter the bus.
        let handlers: Vec<Handler> = {
            let state = self.lock();
            state
                .handlers
                .get(&event.kind())
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(kind = ?event.kind(), "event handler panicked");
            }
        }
    }

    /// Clear handlers for one kind, or all handlers if `None`.
    pub fn remove_all(&self, kind: Option<EventKind>) {
        let mut state = self.lock();
        match kind {
            Some(kind) => {
                state.handlers.remove(&kind);
            }
            None => state.handlers.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event() -> Event {
        Event::JobStart {
            job_id: "j1".into(),
            attempt: 1,
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = Arc::clone(&seen);
            bus.on(EventKind::JobStart, move |_| seen.lock().unwrap().push(n));
        }
        bus.emit(&event());

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_registration() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let sub = bus.on(EventKind::JobStart, move |_| s1.lock().unwrap().push("a"));
        let s2 = seen.clone();
        bus.on(EventKind::JobStart, move |_| s2.lock().unwrap().push("b"));

        bus.off(sub);
        bus.off(sub); // second removal is a no-op
        bus.emit(&event());

        assert_eq!(*seen.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn panicking_handler_does_not_block_later_handlers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.on(EventKind::JobStart, |_| panic!("bad handler"));
        let s = seen.clone();
        bus.on(EventKind::JobStart, move |_| s.lock().unwrap().push("ok"));

        bus.emit(&event()); // must not propagate the panic
        assert_eq!(*seen.lock().unwrap(), vec!["ok"]);
    }

    #[test]
    fn emit_without_handlers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit(&event());
    }

    #[test]
    fn remove_all_clears_one_or_every_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0u32));

        let s = seen.clone();
        bus.on(EventKind::JobStart, move |_| *s.lock().unwrap() += 1);
        let s = seen.clone();
        bus.on(EventKind::JobComplete, move |_| *s.lock().unwrap() += 1);

        bus.remove_all(Some(EventKind::JobStart));
        bus.emit(&event());
        bus.emit(&Event::JobComplete {
            job_id: "j1".into(),
            output: serde_json::json!(null),
        });
        assert_eq!(*seen.lock().unwrap(), 1);

        bus.remove_all(None);
        bus.emit(&Event::JobComplete {
            job_id: "j1".into(),
            output: serde_json::json!(null),
        });
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn handlers_receive_the_event_payload() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));

        let s = seen.clone();
        bus.on(EventKind::ConcurrencyChange, move |event| {
            if let Event::ConcurrencyChange { concurrency } = event {
                *s.lock().unwrap() = Some(*concurrency);
            }
        });
        bus.emit(&Event::ConcurrencyChange { concurrency: 7 });

        assert_eq!(*seen.lock().unwrap(), Some(7));
    }
}
