//! Error types for admission control.

use std::time::Duration;

/// Errors that can occur when acquiring an admission slot.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    /// The wait queue is at capacity (or queueing is disabled and no slot
    /// was free), so the request was rejected without waiting.
    #[error("request queue is full (max {max_queue} waiting)")]
    QueueFull {
        /// Maximum queued waiters allowed; 0 when queueing is disabled.
        max_queue: usize,
    },
    /// No concurrency slot became free within the queue timeout.
    #[error("request timed out in queue after {timeout:?}")]
    QueueTimeout {
        /// The configured per-acquire queue timeout.
        timeout: Duration,
    },
}

/// Result type for admission operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
