//! Error types for the SMTP client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("SMTP error {code}: {message}")]
    SmtpError { code: u16, message: String },

    #[error("Unexpected response {code}: {message}")]
    UnexpectedResponse { code: u16, message: String },

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to parse server response: {0}")]
    ParseError(String),

    #[error("Invalid UTF-8 in server response: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
