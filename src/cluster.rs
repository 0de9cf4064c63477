//! Static replica/node registry and round-robin selection.
//!
//! Built once at startup from the configuration; the only mutable state per
//! replica afterwards is its token bucket and its node cursor.

use crate::config::{Config, Scheme};
use shardgate_throttle::{ThrottleConfig, TokenBucket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

/// Errors assembling the registry from configuration.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("invalid node address {address:?}: {source}")]
    InvalidNodeAddress {
        address: String,
        #[source]
        source: url::ParseError,
    },
    #[error("node {address:?} references undeclared replica {replica:?}")]
    UnknownReplica { replica: String, address: String },
    #[error("no replica has any nodes")]
    Empty,
}

/// One addressable backend endpoint. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Node {
    replica: String,
    address: String,
    url: Url,
}

impl Node {
    fn new(replica: &str, address: &str, scheme: Scheme) -> Result<Self, ClusterError> {
        let url = Url::parse(&format!("{scheme}://{address}")).map_err(|source| {
            ClusterError::InvalidNodeAddress {
                address: address.to_string(),
                source,
            }
        })?;
        Ok(Self {
            replica: replica.to_string(),
            address: address.to_string(),
            url,
        })
    }

    /// Name of the replica this node belongs to.
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// The `host:port` the node was configured with.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The node's absolute base URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// A logical replica: an ordered, non-empty list of interchangeable nodes
/// plus the replica's rate gate.
#[derive(Debug)]
pub struct Replica {
    name: String,
    nodes: Vec<Arc<Node>>,
    bucket: TokenBucket,
    cursor: AtomicUsize,
}

impl Replica {
    fn new(name: String, nodes: Vec<Arc<Node>>, bucket: TokenBucket) -> Self {
        debug_assert!(!nodes.is_empty());
        Self {
            name,
            nodes,
            bucket,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Round-robin pick of the next node.
    pub fn next_node(&self) -> Arc<Node> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&self.nodes[idx % self.nodes.len()])
    }

    /// Waits on the replica's rate gate.
    pub async fn wait(&self) {
        self.bucket.acquire().await;
    }

    /// One-shot switch to the configured slow rate.
    pub fn slow_down(&self) {
        self.bucket.slow_down();
    }

    /// Whether this replica has been slowed down.
    pub fn is_slowed(&self) -> bool {
        self.bucket.is_slowed()
    }
}

/// The full set of replicas plus the dispatcher's round-robin cursor.
#[derive(Debug)]
pub struct Cluster {
    replicas: Vec<Arc<Replica>>,
    cursor: AtomicUsize,
}

impl Cluster {
    /// Groups configured nodes under their declared replicas, in declaration
    /// order. A node naming an undeclared replica is an error; a declared
    /// replica with no nodes is skipped with a warning.
    pub fn from_config(config: &Config) -> Result<Self, ClusterError> {
        for node in &config.nodes {
            if !config.replicas.iter().any(|r| r.name == node.replica) {
                return Err(ClusterError::UnknownReplica {
                    replica: node.replica.clone(),
                    address: node.address.clone(),
                });
            }
        }

        let mut replicas = Vec::with_capacity(config.replicas.len());
        for replica_config in &config.replicas {
            let mut nodes = Vec::new();
            for node_config in &config.nodes {
                if node_config.replica == replica_config.name {
                    nodes.push(Arc::new(Node::new(
                        &replica_config.name,
                        &node_config.address,
                        config.replica_scheme,
                    )?));
                }
            }
            if nodes.is_empty() {
                tracing::warn!(replica = %replica_config.name, "replica has no nodes, skipping");
                continue;
            }

            let name = replica_config.name.clone();
            let log_name = name.clone();
            let bucket = ThrottleConfig::builder()
                .slow_rate(config.slowdown_rate)
                .slow_burst(config.slowdown_burst)
                .name(name.clone())
                .on_slowdown(move |rate, burst| {
                    tracing::warn!(
                        replica = %log_name,
                        rate,
                        burst,
                        "slowing down replica"
                    );
                })
                .build();

            replicas.push(Arc::new(Replica::new(name, nodes, bucket)));
        }

        if replicas.is_empty() {
            return Err(ClusterError::Empty);
        }

        Ok(Self {
            replicas,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Round-robin pick of the next replica. `None` only with an empty
    /// replica list, which construction forbids.
    pub fn next_replica(&self) -> Option<Arc<Replica>> {
        if self.replicas.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&self.replicas[idx % self.replicas.len()]))
    }

    pub fn replicas(&self) -> &[Arc<Replica>] {
        &self.replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config(yaml: &str) -> Config {
        Config::from_yaml(yaml).unwrap()
    }

    #[test]
    fn groups_nodes_under_their_replicas() {
        let cluster = Cluster::from_config(&config(
            r#"
replica_scheme: https
replicas: [{name: r1}, {name: r2}]
nodes:
  - {replica: r1, address: "a:9000"}
  - {replica: r2, address: "b:9000"}
  - {replica: r1, address: "c:9000"}
"#,
        ))
        .unwrap();

        let replicas = cluster.replicas();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].name(), "r1");
        assert_eq!(replicas[0].nodes().len(), 2);
        assert_eq!(replicas[0].nodes()[0].address(), "a:9000");
        assert_eq!(replicas[0].nodes()[1].address(), "c:9000");
        assert_eq!(replicas[1].nodes().len(), 1);
        assert_eq!(
            replicas[0].nodes()[0].url().as_str(),
            "https://a:9000/"
        );
        assert_eq!(replicas[0].nodes()[0].replica(), "r1");
    }

    #[test]
    fn replica_round_robin_visits_each_in_order() {
        let cluster = Cluster::from_config(&config(
            r#"
replicas: [{name: r1}, {name: r2}, {name: r3}]
nodes:
  - {replica: r1, address: "a:9000"}
  - {replica: r2, address: "b:9000"}
  - {replica: r3, address: "c:9000"}
"#,
        ))
        .unwrap();

        let picked: Vec<String> = (0..6)
            .map(|_| cluster.next_replica().unwrap().name().to_string())
            .collect();
        assert_eq!(picked, ["r1", "r2", "r3", "r1", "r2", "r3"]);
    }

    #[test]
    fn node_round_robin_wraps_around() {
        let cluster = Cluster::from_config(&config(
            r#"
replicas: [{name: r1}]
nodes:
  - {replica: r1, address: "a:9000"}
  - {replica: r1, address: "b:9000"}
"#,
        ))
        .unwrap();

        let replica = cluster.next_replica().unwrap();
        let picked: Vec<String> = (0..5)
            .map(|_| replica.next_node().address().to_string())
            .collect();
        assert_eq!(picked, ["a:9000", "b:9000", "a:9000", "b:9000", "a:9000"]);
    }

    #[test]
    fn rejects_nodes_with_undeclared_replicas() {
        let err = Cluster::from_config(&config(
            r#"
replicas: [{name: r1}]
nodes: [{replica: r9, address: "a:9000"}]
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ClusterError::UnknownReplica { .. }));
    }

    #[test]
    fn skips_replicas_without_nodes() {
        let cluster = Cluster::from_config(&config(
            r#"
replicas: [{name: empty}, {name: r1}]
nodes: [{replica: r1, address: "a:9000"}]
"#,
        ))
        .unwrap();
        assert_eq!(cluster.replicas().len(), 1);
        assert_eq!(cluster.replicas()[0].name(), "r1");
    }

    #[test]
    fn fails_when_no_replica_has_nodes() {
        let err = Cluster::from_config(&config("replicas: [{name: r1}]")).unwrap_err();
        assert!(matches!(err, ClusterError::Empty));
    }

    #[test]
    fn slow_down_reaches_the_replica_bucket() {
        let cluster = Cluster::from_config(&config(
            r#"
slowdown_rate: 2.0
replicas: [{name: r1}]
nodes: [{replica: r1, address: "a:9000"}]
"#,
        ))
        .unwrap();

        let replica = cluster.next_replica().unwrap();
        assert!(!replica.is_slowed());
        replica.slow_down();
        replica.slow_down();
        assert!(replica.is_slowed());
    }
}
