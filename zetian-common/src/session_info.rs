//! Session metadata shared between the session engine, the anti-abuse
//! pipeline, and the cluster session registry.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::TlsState;

/// Live view of an inbound session, handed to scorers and handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub remote_ip: IpAddr,
    pub started_at: DateTime<Utc>,
    pub ehlo_name: String,
    pub tls_state: TlsState,
    pub authenticated_identity: Option<String>,
}

/// Replicated registry record for a session, as shipped between cluster
/// nodes. Sessions are referenced by id only; the node map never owns
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRegistryRecord {
    pub session_id: String,
    pub owner_node_id: String,
    pub remote_ip: IpAddr,
    pub started_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub message_count: u32,
    pub affinity_key: Option<String>,
}
