//! Error types for cluster operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Cluster send timed out to {0}")]
    Timeout(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Retryable: the write demanded more replicas than the cluster can
    /// currently acknowledge.
    #[error("Quorum not available: {acked} of {required} acks")]
    QuorumNotAvailable { acked: usize, required: usize },

    #[error("Peer rejected message: {0}")]
    Rejected(String),

    #[error("Frame exceeds maximum size: {0} bytes")]
    FrameTooLarge(usize),
}

impl ClusterError {
    /// Whether retrying later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::QuorumNotAvailable { .. } | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
