//! Configuration surface.
//!
//! The proxy is configured from one YAML document. Durations are humantime
//! strings (`10s`, `500ms`). Validation runs once at startup; everything the
//! dispatcher consumes afterwards is already normalized.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Errors producing a usable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// URL scheme used to reach backend nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// A shard declaration. Informational: shard membership does not influence
/// dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A logical replica declaration; nodes attach to it by name.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// One backend endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub shard: String,
    pub replica: String,
    pub address: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bind address for the inbound HTTP server.
    #[serde(default)]
    pub listen_addr: String,
    /// Required header whose value is the tenant group key.
    #[serde(default)]
    pub header_name: String,
    /// Per-group concurrency cap; values below 1 are coerced to 1.
    #[serde(default)]
    pub max_concurrent: i64,
    /// Per-group queue cap; values below 1 disable queueing.
    #[serde(default)]
    pub max_queue: i64,
    /// Maximum wait for a concurrency slot per request.
    #[serde(default = "default_queue_timeout", with = "humantime_serde")]
    pub queue_timeout: Duration,
    /// Scheme used to reach backend nodes.
    #[serde(default)]
    pub replica_scheme: Scheme,

    #[serde(default)]
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Substring in a backend error body that triggers slow-down.
    #[serde(default)]
    pub slowdown_error: String,
    /// Upstream status code that triggers slow-down; 0 disables.
    #[serde(default)]
    pub slowdown_code: u16,
    /// Tokens per second once a replica is slowed.
    #[serde(default = "default_slowdown_rate")]
    pub slowdown_rate: f64,
    /// Burst once a replica is slowed.
    #[serde(default = "default_slowdown_burst")]
    pub slowdown_burst: usize,

    /// Upstream request timeout; 0 falls back to 120s.
    #[serde(default = "default_proxy_timeout", with = "humantime_serde")]
    pub proxy_timeout: Duration,
    /// If non-empty, replaces the outbound User-Agent.
    #[serde(default)]
    pub user_agent: String,
    /// Informational configuration version.
    #[serde(default)]
    pub version: String,
}

fn default_queue_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_slowdown_rate() -> f64 {
    1.0
}

fn default_slowdown_burst() -> usize {
    1
}

fn default_proxy_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Config {
    /// Reads, parses, and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration from a YAML string, without validation.
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Checks required fields and normalizes degenerate values.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.listen_addr.is_empty() {
            return Err(ConfigError::Invalid("listen_addr is required".to_string()));
        }
        if self.header_name.is_empty() {
            return Err(ConfigError::Invalid("header_name is required".to_string()));
        }
        if self.replicas.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one replica is required".to_string(),
            ));
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one node is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate shard name {:?}",
                    shard.name
                )));
            }
        }
        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if !seen.insert(replica.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate replica name {:?}",
                    replica.name
                )));
            }
        }

        if self.max_concurrent < 1 {
            tracing::warn!(
                max_concurrent = self.max_concurrent,
                "max_concurrent must be positive, using 1"
            );
            self.max_concurrent = 1;
        }
        if self.proxy_timeout.is_zero() {
            tracing::warn!("proxy_timeout not set, using 120s");
            self.proxy_timeout = default_proxy_timeout();
        }
        if self.slowdown_error.is_empty() && self.slowdown_code == 0 {
            tracing::warn!(
                "neither slowdown_error nor slowdown_code is set; replica slow-down will never trigger"
            );
        }

        Ok(())
    }

    /// The queue cap as the limiter understands it: 0 means disabled.
    pub fn effective_max_queue(&self) -> usize {
        self.max_queue.max(0) as usize
    }

    /// The concurrency cap after normalization.
    pub fn effective_max_concurrent(&self) -> usize {
        self.max_concurrent.max(1) as usize
    }
}
