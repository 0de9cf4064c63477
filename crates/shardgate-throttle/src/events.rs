//! Events emitted by the token bucket.

use shardgate_core::GateEvent;
use std::time::{Duration, Instant};

/// Events emitted by a [`TokenBucket`](crate::TokenBucket).
#[derive(Debug, Clone)]
pub enum ThrottleEvent {
    /// The bucket switched from unlimited to the configured slow rate.
    /// Emitted at most once per bucket.
    SlowdownEngaged {
        /// Replica this bucket throttles.
        name: String,
        /// When the event occurred.
        timestamp: Instant,
        /// The rate now in effect, in tokens per second.
        rate: f64,
        /// The burst now in effect.
        burst: usize,
    },

    /// An acquisition had to wait for a token. Emitted once per delayed
    /// acquisition, with the initially computed wait.
    AcquireDelayed {
        /// Replica this bucket throttles.
        name: String,
        /// When the event occurred.
        timestamp: Instant,
        /// Time until a token was expected to accrue.
        wait: Duration,
    },
}

impl GateEvent for ThrottleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::SlowdownEngaged { .. } => "slowdown_engaged",
            Self::AcquireDelayed { .. } => "acquire_delayed",
        }
    }

    fn source(&self) -> &str {
        match self {
            Self::SlowdownEngaged { name, .. } | Self::AcquireDelayed { name, .. } => name,
        }
    }
}
