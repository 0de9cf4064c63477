//! Events emitted by the group limiter.

use shardgate_core::GateEvent;
use std::time::{Duration, Instant};

/// Events emitted by a [`GroupLimiter`](crate::GroupLimiter).
#[derive(Debug, Clone)]
pub enum AdmissionEvent {
    /// A concurrency slot was granted, possibly after queueing.
    SlotAcquired {
        /// Tenant group this limiter guards.
        group: String,
        /// When the event occurred.
        timestamp: Instant,
        /// Number of in-flight requests after this grant.
        in_flight: usize,
        /// How long the request waited for the slot.
        waited: Duration,
    },

    /// The request was rejected without waiting: the queue was full, or
    /// queueing is disabled and no slot was free.
    QueueRejected {
        /// Tenant group this limiter guards.
        group: String,
        /// When the event occurred.
        timestamp: Instant,
        /// Maximum queued waiters allowed.
        max_queue: usize,
    },

    /// The request waited the full queue timeout without a slot freeing up.
    QueueTimedOut {
        /// Tenant group this limiter guards.
        group: String,
        /// When the event occurred.
        timestamp: Instant,
        /// How long the request waited before giving up.
        waited: Duration,
    },

    /// A previously granted slot was returned.
    SlotReleased {
        /// Tenant group this limiter guards.
        group: String,
        /// When the event occurred.
        timestamp: Instant,
        /// How long the slot was held.
        held: Duration,
    },
}

impl GateEvent for AdmissionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::SlotAcquired { .. } => "slot_acquired",
            Self::QueueRejected { .. } => "queue_rejected",
            Self::QueueTimedOut { .. } => "queue_timed_out",
            Self::SlotReleased { .. } => "slot_released",
        }
    }

    fn source(&self) -> &str {
        match self {
            Self::SlotAcquired { group, .. }
            | Self::QueueRejected { group, .. }
            | Self::QueueTimedOut { group, .. }
            | Self::SlotReleased { group, .. } => group,
        }
    }
}
