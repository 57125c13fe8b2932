//! Cluster coordination: membership, heartbeat-driven failure
//! detection, session and state replication, quorum tracking, leader
//! awareness, and session migration on node loss.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod node;
pub mod transport;

pub use config::{ClusterOptions, ConsistencyLevel};
pub use coordinator::{ClusterEvent, ClusterState, Coordinator};
pub use error::ClusterError;
pub use message::{AckPayload, Frame, Payload};
pub use node::{ClusterNode, NodeLoad, NodeState};
