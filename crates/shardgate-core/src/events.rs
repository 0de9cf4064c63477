//! Event plumbing for the shardgate limiters.
//!
//! The limiter crates stay backend-agnostic: they describe what happened
//! (an admission decision, a slow-down) as a typed event and hand it to
//! whatever callbacks the dispatcher registered at build time. A callback
//! that panics is contained, so the limiter — and the request it is
//! gating — keeps going.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Implemented by the limiter event enums so emission failures can be
/// attributed in logs.
pub trait GateEvent {
    /// Short machine-readable kind, e.g. "queue_rejected".
    fn event_type(&self) -> &'static str;

    /// The limiter instance that emitted this event: a tenant group key or
    /// a replica name.
    fn source(&self) -> &str;
}

/// The callbacks registered for one limiter instance.
///
/// Listeners are plain closures. They run synchronously on the emitting
/// task, in registration order; cloning the collection (limiter configs
/// are `Clone`) shares the same callbacks.
pub struct EventListeners<E> {
    listeners: Vec<Arc<dyn Fn(&E) + Send + Sync>>,
}

impl<E: GateEvent> EventListeners<E> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Registers a callback.
    pub fn add<F>(&mut self, listener: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Hands the event to every registered callback.
    ///
    /// A panicking callback is logged and skipped; the remaining callbacks
    /// still run, and the panic never reaches the limiter.
    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let listener = listener.as_ref();
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(
                    source = event.source(),
                    event_type = event.event_type(),
                    "limiter event listener panicked"
                );

                #[cfg(feature = "metrics")]
                metrics::counter!(
                    "shardgate_event_listener_panics_total",
                    "source" => event.source().to_string(),
                    "event_type" => event.event_type().to_string()
                )
                .increment(1);
            }
        }
    }
}

impl<E> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E> std::fmt::Debug for EventListeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListeners")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct ProbeEvent {
        label: &'static str,
    }

    impl GateEvent for ProbeEvent {
        fn event_type(&self) -> &'static str {
            "probe"
        }

        fn source(&self) -> &str {
            self.label
        }
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut listeners = EventListeners::new();
        let first = Arc::clone(&seen);
        listeners.add(move |_: &ProbeEvent| first.lock().unwrap().push("first"));
        let second = Arc::clone(&seen);
        listeners.add(move |_: &ProbeEvent| second.lock().unwrap().push("second"));

        listeners.emit(&ProbeEvent { label: "tenant-a" });
        listeners.emit(&ProbeEvent { label: "tenant-a" });

        assert_eq!(
            *seen.lock().unwrap(),
            ["first", "second", "first", "second"]
        );
    }

    #[test]
    fn a_panicking_callback_does_not_stop_the_rest() {
        let calls = Arc::new(Mutex::new(0));

        let mut listeners = EventListeners::new();
        listeners.add(|_: &ProbeEvent| panic!("boom"));
        let counter = Arc::clone(&calls);
        listeners.add(move |_: &ProbeEvent| *counter.lock().unwrap() += 1);

        listeners.emit(&ProbeEvent { label: "tenant-a" });

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn cloned_collections_share_their_callbacks() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);

        let mut listeners = EventListeners::new();
        listeners.add(move |_: &ProbeEvent| *counter.lock().unwrap() += 1);
        let cloned = listeners.clone();

        listeners.emit(&ProbeEvent { label: "tenant-a" });
        cloned.emit(&ProbeEvent { label: "tenant-a" });

        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
