//! Cluster wire protocol: length-prefixed bincode frames over TCP.
//!
//! Every payload is an enumerated variant; the dispatcher matches on the
//! tag, never on runtime property lookup.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;
use zetian_common::SessionRegistryRecord;

use crate::{
    error::{ClusterError, Result},
    node::{ClusterNode, NodeLoad},
};

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub original_message_id: Uuid,
    pub success: bool,
    pub error: Option<String>,
    /// Optional response data (e.g. the roster answering a Join).
    pub result: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Heartbeat {
        load: NodeLoad,
        /// The sender's cluster endpoint; connections arrive from
        /// ephemeral ports, so discovery needs it spelled out.
        endpoint: SocketAddr,
    },
    Join {
        endpoint: SocketAddr,
        version: String,
        capabilities: Vec<String>,
    },
    Leave,
    SessionReplicate(SessionRegistryRecord),
    SessionRemove {
        session_id: String,
    },
    SessionMigrate {
        record: SessionRegistryRecord,
        new_owner: String,
    },
    StateReplicate {
        key: String,
        value: Vec<u8>,
    },
    ConfigurationUpdate {
        key: String,
        value: String,
    },
    HealthCheck,
    Ack(AckPayload),
}

impl Payload {
    /// Tag name for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::SessionReplicate(_) => "session-replicate",
            Self::SessionRemove { .. } => "session-remove",
            Self::SessionMigrate { .. } => "session-migrate",
            Self::StateReplicate { .. } => "state-replicate",
            Self::ConfigurationUpdate { .. } => "configuration-update",
            Self::HealthCheck => "health-check",
            Self::Ack(_) => "ack",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub message_id: Uuid,
    pub source_node_id: String,
    pub target_node_id: Option<String>,
    pub payload: Payload,
    pub requires_ack: bool,
    pub ttl_secs: u64,
}

impl Frame {
    #[must_use]
    pub fn new(source: impl Into<String>, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            source_node_id: source.into(),
            target_node_id: None,
            payload,
            requires_ack: false,
            ttl_secs: 60,
        }
    }

    #[must_use]
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target_node_id = Some(target.into());
        self
    }

    #[must_use]
    pub const fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    /// The ack answering this frame.
    #[must_use]
    pub fn ack(&self, from: impl Into<String>, success: bool, error: Option<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            source_node_id: from.into(),
            target_node_id: Some(self.source_node_id.clone()),
            payload: Payload::Ack(AckPayload {
                original_message_id: self.message_id,
                success,
                error,
                result: None,
            }),
            requires_ack: false,
            ttl_secs: self.ttl_secs,
        }
    }
}

/// Serialize the roster for a Join ack.
pub fn encode_roster(nodes: &[ClusterNode]) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        nodes,
        bincode::config::standard(),
    )?)
}

pub fn decode_roster(bytes: &[u8]) -> Result<Vec<ClusterNode>> {
    let (nodes, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(nodes)
}

/// Write one frame: 4-byte big-endian length, then the bincode body.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = bincode::serde::encode_to_vec(frame, bincode::config::standard())?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ClusterError::FrameTooLarge(bytes.len()));
    }
    let len = u32::try_from(bytes.len()).map_err(|_| ClusterError::FrameTooLarge(bytes.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ClusterError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let (frame, _) = bincode::serde::decode_from_slice(&body, bincode::config::standard())?;
    Ok(Some(frame))
}
