//! Shardgate: a tenant-isolating reverse proxy for columnar database
//! clusters.
//!
//! The proxy sits in front of a set of backend nodes organized as
//! shards × replicas. It bounds each tenant's in-flight work (see
//! [`shardgate_admission`]), spreads surviving requests round-robin over
//! replicas and their nodes ([`cluster`]), and backs a replica off to a
//! configured slow rate when the backend signals overload
//! ([`shardgate_throttle`]). The [`gateway`] module composes all of it
//! behind one transparent HTTP handler.

pub mod cluster;
pub mod config;
pub mod error;
pub mod gateway;

pub use config::Config;
pub use error::{GatewayError, StartupError};
pub use gateway::{router, Gateway};
