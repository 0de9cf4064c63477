//! Per-tenant admission control for shardgate.
//!
//! A [`GroupLimiter`] isolates one tenant from the rest of the fleet by
//! bounding how much of the proxy that tenant can occupy: at most
//! `max_concurrent` requests in flight, at most `max_queue` waiting for a
//! slot, and no wait longer than `queue_timeout`. Everything beyond those
//! bounds is rejected instantly, which is what keeps one noisy tenant from
//! queueing everyone else into timeouts.
//!
//! # Basic Example
//!
//! ```rust
//! use shardgate_admission::AdmissionConfig;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let limiter = AdmissionConfig::builder()
//!     .max_concurrent(4)
//!     .max_queue(16)
//!     .queue_timeout(Duration::from_secs(10))
//!     .name("tenant-a")
//!     .build();
//!
//! match limiter.acquire().await {
//!     Ok(_permit) => {
//!         // Forward the request; the slot frees when the permit drops.
//!     }
//!     Err(err) => {
//!         // Map to 429 Too Many Requests.
//!         let _ = err;
//!     }
//! }
//! # }
//! ```
//!
//! # Example with Event Listeners
//!
//! ```rust
//! use shardgate_admission::AdmissionConfig;
//!
//! # async fn example() {
//! let limiter = AdmissionConfig::builder()
//!     .max_concurrent(8)
//!     .name("tenant-b")
//!     .on_queue_rejected(|max_queue| {
//!         println!("rejected: queue of {} is full", max_queue);
//!     })
//!     .on_slot_released(|held| {
//!         println!("slot held for {:?}", held);
//!     })
//!     .build();
//! # let _ = limiter;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod limiter;

pub use config::{AdmissionConfig, AdmissionConfigBuilder};
pub use error::{AdmissionError, Result};
pub use events::AdmissionEvent;
pub use limiter::{AdmissionPermit, GroupLimiter};
