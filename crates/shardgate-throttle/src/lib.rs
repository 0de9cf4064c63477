//! Per-replica throttling for shardgate.
//!
//! A [`TokenBucket`] sits in front of one backend replica. It starts
//! unlimited — forwarding is not throttled at all — and switches exactly
//! once to a configured slow rate when the backend signals overload
//! (see [`TokenBucket::slow_down`]). There is no transition back; recovery
//! is a deliberate extension point.
//!
//! # Example
//!
//! ```rust
//! use shardgate_throttle::ThrottleConfig;
//!
//! # async fn example() {
//! let bucket = ThrottleConfig::builder()
//!     .slow_rate(1.0)
//!     .slow_burst(1)
//!     .name("replica-1")
//!     .on_slowdown(|rate, burst| {
//!         println!("slowed to {} req/s (burst {})", rate, burst);
//!     })
//!     .build();
//!
//! bucket.acquire().await; // immediate while unlimited
//! bucket.slow_down();     // backend said "too many queries"
//! bucket.acquire().await; // now paced at 1 req/s
//! # }
//! ```

pub mod bucket;
pub mod config;
pub mod events;

pub use bucket::TokenBucket;
pub use config::{ThrottleConfig, ThrottleConfigBuilder};
pub use events::ThrottleEvent;
