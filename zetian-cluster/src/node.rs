//! Cluster node records.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Active,
    Suspected,
    Failed,
    Maintenance,
    Leaving,
}

/// Load snapshot carried on every heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub active_sessions: u32,
    pub bandwidth_bytes_per_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub endpoint: SocketAddr,
    pub state: NodeState,
    pub last_heartbeat_at: DateTime<Utc>,
    pub load: NodeLoad,
    pub capabilities: Vec<String>,
}

impl ClusterNode {
    #[must_use]
    pub fn new(id: impl Into<String>, endpoint: SocketAddr) -> Self {
        Self {
            id: id.into(),
            endpoint,
            state: NodeState::Active,
            last_heartbeat_at: Utc::now(),
            load: NodeLoad::default(),
            capabilities: Vec::new(),
        }
    }

    /// Milliseconds since the last heartbeat.
    #[must_use]
    pub fn heartbeat_age_ms(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.last_heartbeat_at).num_milliseconds().max(0)).unwrap_or(0)
    }
}
