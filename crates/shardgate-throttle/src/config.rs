//! Configuration for the token bucket.

use crate::bucket::TokenBucket;
use crate::events::ThrottleEvent;
use shardgate_core::events::EventListeners;
use std::time::Duration;

/// Configuration for a [`TokenBucket`].
#[derive(Clone, Debug)]
pub struct ThrottleConfig {
    /// Tokens per second once slowed down.
    pub(crate) slow_rate: f64,
    /// Bucket capacity once slowed down.
    pub(crate) slow_burst: usize,
    /// Replica this bucket throttles.
    pub(crate) name: String,
    /// Event listeners.
    pub(crate) event_listeners: EventListeners<ThrottleEvent>,
}

impl ThrottleConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ThrottleConfigBuilder {
        ThrottleConfigBuilder::new()
    }
}

/// Builder for [`ThrottleConfig`].
pub struct ThrottleConfigBuilder {
    slow_rate: f64,
    slow_burst: usize,
    name: String,
    event_listeners: EventListeners<ThrottleEvent>,
}

impl ThrottleConfigBuilder {
    /// Creates a new builder with default values.
    ///
    /// Defaults:
    /// - slow_rate: 1.0 tokens per second
    /// - slow_burst: 1
    /// - name: `"<unnamed>"`
    pub fn new() -> Self {
        Self {
            slow_rate: 1.0,
            slow_burst: 1,
            name: "<unnamed>".to_string(),
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the rate (tokens per second) in effect after
    /// [`slow_down`](TokenBucket::slow_down).
    ///
    /// Values that are not finite and positive are coerced to 1.0.
    pub fn slow_rate(mut self, rate: f64) -> Self {
        self.slow_rate = rate;
        self
    }

    /// Sets the burst (bucket capacity) in effect after
    /// [`slow_down`](TokenBucket::slow_down).
    ///
    /// A value of 0 is coerced to 1.
    pub fn slow_burst(mut self, burst: usize) -> Self {
        self.slow_burst = burst;
        self
    }

    /// Sets the replica name (used in events).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Registers a callback for the one-shot slow-down transition.
    ///
    /// # Callback Signature
    /// `Fn(f64, usize)` - Called with the rate and burst now in effect.
    pub fn on_slowdown<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &ThrottleEvent| {
            if let ThrottleEvent::SlowdownEngaged { rate, burst, .. } = event {
                f(*rate, *burst);
            }
        });
        self
    }

    /// Registers a callback when an acquisition has to wait for a token.
    ///
    /// # Callback Signature
    /// `Fn(Duration)` - Called with the initially computed wait.
    pub fn on_delayed<F>(mut self, f: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &ThrottleEvent| {
            if let ThrottleEvent::AcquireDelayed { wait, .. } = event {
                f(*wait);
            }
        });
        self
    }

    /// Builds the bucket, starting in the unlimited state.
    pub fn build(self) -> TokenBucket {
        let slow_rate = if self.slow_rate.is_finite() && self.slow_rate > 0.0 {
            self.slow_rate
        } else {
            1.0
        };
        let config = ThrottleConfig {
            slow_rate,
            slow_burst: self.slow_burst.max(1),
            name: self.name,
            event_listeners: self.event_listeners,
        };
        TokenBucket::new(config)
    }
}

impl Default for ThrottleConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
