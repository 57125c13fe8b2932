//! Cluster configuration surface.

use std::net::SocketAddr;

use serde::Deserialize;

/// How many replica acknowledgements a state write demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    /// Local write only.
    One,
    /// Local write plus a majority of the replica set.
    #[default]
    Quorum,
    /// Local write plus every replica.
    All,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterOptions {
    /// This node's identity. Must be unique across the cluster.
    pub node_id: String,
    /// TCP port (and bind address) for cluster traffic.
    pub bind: SocketAddr,
    /// Peers contacted at startup to join the cluster.
    #[serde(default)]
    pub seed_nodes: Vec<SocketAddr>,
    /// Copies of each piece of session/state data, this node included.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    /// Overrides the derived quorum ack count for `Quorum` writes.
    #[serde(default)]
    pub min_replicas_for_write: Option<usize>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Grace period before a fresh election is acted on after a leader
    /// failure.
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
    /// Missing heartbeats past this age mark a peer Suspected; past
    /// twice this age, Failed.
    #[serde(default = "default_failure_threshold_ms")]
    pub failure_threshold_ms: u64,
    /// Cadence of the failure-detection sweep.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Timeout for an acknowledged send.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Replica placement strategy; `least-sessions` is the only
    /// implemented strategy and the default.
    #[serde(default = "default_load_balancing_strategy")]
    pub load_balancing_strategy: String,
    /// Honor session affinity keys when placing replicas.
    #[serde(default)]
    pub session_affinity: bool,
    /// Label of the backing state store; the in-process KV is the only
    /// in-tree implementation.
    #[serde(default)]
    pub state_store: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

const fn default_replication_factor() -> usize {
    2
}

const fn default_heartbeat_interval_ms() -> u64 {
    1000
}

const fn default_failure_threshold_ms() -> u64 {
    5000
}

const fn default_check_interval_ms() -> u64 {
    1000
}

const fn default_send_timeout_ms() -> u64 {
    5000
}

const fn default_election_timeout_ms() -> u64 {
    10_000
}

fn default_load_balancing_strategy() -> String {
    "least-sessions".to_string()
}

impl ClusterOptions {
    #[must_use]
    pub fn new(node_id: impl Into<String>, bind: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            bind,
            seed_nodes: Vec::new(),
            replication_factor: default_replication_factor(),
            min_replicas_for_write: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_ms: default_election_timeout_ms(),
            failure_threshold_ms: default_failure_threshold_ms(),
            check_interval_ms: default_check_interval_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            load_balancing_strategy: default_load_balancing_strategy(),
            session_affinity: false,
            state_store: None,
            capabilities: Vec::new(),
        }
    }

    /// Peer acks required for a `Quorum` write: `⌈(RF−1)/2⌉`, unless
    /// `min_replicas_for_write` pins a different count.
    #[must_use]
    pub fn quorum_acks(&self) -> usize {
        self.min_replicas_for_write
            .unwrap_or_else(|| self.replication_factor.saturating_sub(1).div_ceil(2))
    }
}
