//! Typed error handling for delivery operations.
//!
//! Distinguishes permanent failures (5xx, never retried), temporary
//! failures (4xx and network trouble, retried with backoff), and system
//! errors.

use thiserror::Error;

use zetian_smtp::client::ClientError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("No route to domain: {0}")]
    NoRoute(String),

    #[error("No mail servers available for domain: {0}")]
    NoMailServers(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS required: {0}")]
    TlsRequired(String),
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Server busy: {0}")]
    ServerBusy(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("Connection timed out: {0}")]
    Timeout(String),

    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<zetian_store::StoreError> for DeliveryError {
    fn from(error: zetian_store::StoreError) -> Self {
        Self::System(SystemError::Store(error.to_string()))
    }
}

/// SMTP client errors map onto the retry taxonomy by response class:
/// 4xx and connection trouble are temporary, 5xx are permanent.
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } if (400..500).contains(&code) => {
                Self::Temporary(TemporaryError::SmtpTemporary(format!("{code} {message}")))
            }

            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
            }

            ClientError::SmtpError { code, message }
            | ClientError::UnexpectedResponse { code, message } => Self::System(
                SystemError::Internal(format!("Unexpected SMTP response: {code} {message}")),
            ),

            ClientError::Io(e) => {
                Self::Temporary(TemporaryError::ConnectionFailed(format!("I/O error: {e}")))
            }

            ClientError::ConnectionClosed => Self::Temporary(TemporaryError::ConnectionFailed(
                "Connection closed unexpectedly".to_string(),
            )),

            ClientError::TlsError(msg) => Self::Temporary(TemporaryError::TlsHandshakeFailed(msg)),

            ClientError::ParseError(msg) => Self::System(SystemError::Internal(format!(
                "SMTP protocol parse error: {msg}"
            ))),

            ClientError::Utf8Error(e) => {
                Self::System(SystemError::Internal(format!("UTF-8 decoding error: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_predicates() {
        let temp = DeliveryError::Temporary(TemporaryError::ConnectionFailed("x".into()));
        assert!(temp.is_temporary());
        assert!(!temp.is_permanent());

        let perm = DeliveryError::Permanent(PermanentError::InvalidRecipient("x".into()));
        assert!(perm.is_permanent());
        assert!(!perm.is_temporary());
    }

    #[test]
    fn client_error_4xx_is_temporary() {
        let err: DeliveryError = ClientError::SmtpError {
            code: 421,
            message: "busy".into(),
        }
        .into();
        assert!(err.is_temporary());
    }

    #[test]
    fn client_error_5xx_is_permanent() {
        let err: DeliveryError = ClientError::SmtpError {
            code: 550,
            message: "no such user".into(),
        }
        .into();
        assert!(err.is_permanent());
        assert_eq!(
            err.to_string(),
            "Permanent failure: Message rejected: 550 no such user"
        );
    }

    #[test]
    fn io_errors_are_temporary() {
        let err: DeliveryError = ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ))
        .into();
        assert!(err.is_temporary());
    }
}
