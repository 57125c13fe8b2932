//! Error types for SMTP sessions and connections.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to load certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to load key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),

    #[error("TLS protocol info missing: {0}")]
    ProtocolInfoMissing(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Formatting error: {0}")]
    Format(#[from] std::fmt::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session timed out after {0} seconds")]
    Timeout(u64),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Handler error: {0}")]
    Handler(String),
}

pub type TlsResult<T> = std::result::Result<T, TlsError>;
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;
