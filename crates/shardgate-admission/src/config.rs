//! Configuration for the group limiter.

use crate::events::AdmissionEvent;
use crate::limiter::GroupLimiter;
use shardgate_core::events::EventListeners;
use std::time::Duration;

/// Configuration for a [`GroupLimiter`].
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Maximum number of concurrently admitted requests.
    pub(crate) max_concurrent: usize,
    /// Maximum number of requests waiting for a slot; 0 disables queueing.
    pub(crate) max_queue: usize,
    /// Maximum time a request may wait for a slot.
    pub(crate) queue_timeout: Duration,
    /// Tenant group this limiter guards.
    pub(crate) name: String,
    /// Event listeners.
    pub(crate) event_listeners: EventListeners<AdmissionEvent>,
}

impl AdmissionConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> AdmissionConfigBuilder {
        AdmissionConfigBuilder::new()
    }
}

/// Builder for [`AdmissionConfig`].
pub struct AdmissionConfigBuilder {
    max_concurrent: usize,
    max_queue: usize,
    queue_timeout: Duration,
    name: String,
    event_listeners: EventListeners<AdmissionEvent>,
}

impl AdmissionConfigBuilder {
    /// Creates a new builder with default values.
    ///
    /// Defaults:
    /// - max_concurrent: 1
    /// - max_queue: 0 (queueing disabled)
    /// - queue_timeout: 10 seconds
    /// - name: `"<unnamed>"`
    pub fn new() -> Self {
        Self {
            max_concurrent: 1,
            max_queue: 0,
            queue_timeout: Duration::from_secs(10),
            name: "<unnamed>".to_string(),
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the maximum number of concurrently admitted requests.
    ///
    /// A value of 0 is coerced to 1.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Sets the maximum number of requests waiting for a slot.
    ///
    /// With 0 queueing is disabled: acquisition either succeeds immediately
    /// or fails with [`AdmissionError::QueueFull`](crate::AdmissionError::QueueFull).
    pub fn max_queue(mut self, max: usize) -> Self {
        self.max_queue = max;
        self
    }

    /// Sets the maximum time a queued request may wait for a slot.
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Sets the tenant group name (used in events).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Registers a callback when a slot is granted.
    ///
    /// # Callback Signature
    /// `Fn(usize)` - Called with the number of in-flight requests after the grant.
    pub fn on_slot_acquired<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &AdmissionEvent| {
            if let AdmissionEvent::SlotAcquired { in_flight, .. } = event {
                f(*in_flight);
            }
        });
        self
    }

    /// Registers a callback when a request is rejected because the queue is
    /// full (or queueing is disabled and no slot was free).
    ///
    /// # Callback Signature
    /// `Fn(usize)` - Called with the configured maximum number of queued waiters.
    pub fn on_queue_rejected<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &AdmissionEvent| {
            if let AdmissionEvent::QueueRejected { max_queue, .. } = event {
                f(*max_queue);
            }
        });
        self
    }

    /// Registers a callback when a queued request gives up after the queue
    /// timeout.
    ///
    /// # Callback Signature
    /// `Fn(Duration)` - Called with the time the request spent waiting.
    pub fn on_queue_timed_out<F>(mut self, f: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &AdmissionEvent| {
            if let AdmissionEvent::QueueTimedOut { waited, .. } = event {
                f(*waited);
            }
        });
        self
    }

    /// Registers a callback when a slot is returned.
    ///
    /// # Callback Signature
    /// `Fn(Duration)` - Called with the time the slot was held.
    pub fn on_slot_released<F>(mut self, f: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &AdmissionEvent| {
            if let AdmissionEvent::SlotReleased { held, .. } = event {
                f(*held);
            }
        });
        self
    }

    /// Builds the limiter.
    pub fn build(self) -> GroupLimiter {
        let config = AdmissionConfig {
            max_concurrent: self.max_concurrent.max(1),
            max_queue: self.max_queue,
            queue_timeout: self.queue_timeout,
            name: self.name,
            event_listeners: self.event_listeners,
        };
        GroupLimiter::new(config)
    }
}

impl Default for AdmissionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
