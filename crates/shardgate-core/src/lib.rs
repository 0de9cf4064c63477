//! Core infrastructure for shardgate.
//!
//! This crate provides the event system shared by the limiter crates:
//! typed events for admission and throttling decisions, plus the callback
//! collection the proxy uses to hook those decisions into logging and
//! metrics.

pub mod events;

pub use events::{EventListeners, GateEvent};
