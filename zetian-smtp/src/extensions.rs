use core::fmt::{self, Display};
use std::path::PathBuf;

use serde::Deserialize;

/// TLS material for STARTTLS support.
#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// SASL mechanisms the server can advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mechanism {
    Plain,
    Login,
}

impl Display for Mechanism {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        })
    }
}

/// SMTP protocol extensions advertised in the EHLO response.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum Extension {
    /// Command pipelining (RFC 2920).
    Pipelining,
    /// 8-bit MIME transport (RFC 6152).
    EightBitMime,
    /// Message size declaration and enforcement (RFC 1870).
    ///
    /// Zero means no limit is enforced. Validated against the declared
    /// SIZE parameter at MAIL time and against received bytes at DATA
    /// time; both reject with 552.
    Size(usize),
    /// Connection upgrade to TLS (RFC 3207). Only advertised while the
    /// session is still plaintext.
    Starttls(TlsContext),
    /// SASL authentication (RFC 4954).
    Auth(Vec<Mechanism>),
    /// UTF-8 addresses (RFC 6531).
    SmtpUtf8,
    /// BDAT chunking (RFC 3030).
    Chunking,
    /// Binary MIME bodies, carried via BDAT (RFC 3030).
    BinaryMime,
    /// Structured status codes in replies (RFC 2034).
    EnhancedStatusCodes,
    /// Command help.
    Help,
}

impl Extension {
    /// The EHLO keyword line for this extension, if it is advertised in
    /// the current session state (`tls_active`, authentication policy).
    #[must_use]
    pub fn keyword(&self, tls_active: bool, allow_plaintext_auth: bool) -> Option<String> {
        match self {
            Self::Pipelining => Some("PIPELINING".to_string()),
            Self::EightBitMime => Some("8BITMIME".to_string()),
            Self::Size(0) => Some("SIZE".to_string()),
            Self::Size(max) => Some(format!("SIZE {max}")),
            // STARTTLS disappears once the connection is already TLS
            Self::Starttls(_) => (!tls_active).then(|| "STARTTLS".to_string()),
            Self::Auth(mechanisms) => {
                if mechanisms.is_empty() || (!tls_active && !allow_plaintext_auth) {
                    None
                } else {
                    let list = mechanisms
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" ");
                    Some(format!("AUTH {list}"))
                }
            }
            Self::SmtpUtf8 => Some("SMTPUTF8".to_string()),
            Self::Chunking => Some("CHUNKING".to_string()),
            Self::BinaryMime => Some("BINARYMIME".to_string()),
            Self::EnhancedStatusCodes => Some("ENHANCEDSTATUSCODES".to_string()),
            Self::Help => Some("HELP".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_rendering() {
        assert_eq!(
            Extension::Size(100_000_000).keyword(false, true),
            Some("SIZE 100000000".to_string())
        );
        assert_eq!(Extension::Size(0).keyword(false, true), Some("SIZE".to_string()));
    }

    #[test]
    fn starttls_hidden_after_upgrade() {
        let ext = Extension::Starttls(TlsContext {
            certificate: "cert.pem".into(),
            key: "key.pem".into(),
        });
        assert_eq!(ext.keyword(false, true), Some("STARTTLS".to_string()));
        assert_eq!(ext.keyword(true, true), None);
    }

    #[test]
    fn auth_respects_plaintext_policy() {
        let ext = Extension::Auth(vec![Mechanism::Plain, Mechanism::Login]);
        assert_eq!(ext.keyword(false, false), None);
        assert_eq!(ext.keyword(true, false), Some("AUTH PLAIN LOGIN".to_string()));
        assert_eq!(ext.keyword(false, true), Some("AUTH PLAIN LOGIN".to_string()));
    }
}
