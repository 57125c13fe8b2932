//! Mailbox addresses as they appear in SMTP reverse and forward paths.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Domain;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed address: {0}")]
    Malformed(String),

    #[error("Address has no domain part: {0}")]
    MissingDomain(String),

    #[error("Address is not ASCII and SMTPUTF8 was not negotiated: {0}")]
    NonAscii(String),
}

/// A single `local@domain` mailbox.
///
/// The local part keeps its original case (it is semantically
/// case-sensitive per RFC 5321); the domain is normalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    local: String,
    domain: Domain,
}

impl Address {
    /// Parse a path argument as it arrives on MAIL FROM / RCPT TO.
    ///
    /// Accepts both angle-bracketed (`<user@example.com>`) and bare forms.
    /// The null path `<>` is not an address; callers handle it before
    /// parsing.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let stripped = trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed);

        if stripped.is_empty() {
            return Err(AddressError::Malformed(input.to_string()));
        }

        // mailparse handles quoted local parts and display names for us
        let parsed = mailparse::addrparse(stripped)
            .map_err(|e| AddressError::Malformed(format!("{input}: {e}")))?;

        let addr = match parsed.first() {
            Some(mailparse::MailAddr::Single(single)) => single.addr.clone(),
            _ => return Err(AddressError::Malformed(input.to_string())),
        };

        let (local, domain) = addr
            .rsplit_once('@')
            .ok_or_else(|| AddressError::MissingDomain(addr.clone()))?;

        if local.is_empty() || domain.is_empty() {
            return Err(AddressError::MissingDomain(addr.clone()));
        }

        Ok(Self {
            local: local.to_string(),
            domain: Domain::new(domain),
        })
    }

    /// Parse, additionally rejecting non-ASCII addresses unless the
    /// session negotiated SMTPUTF8.
    pub fn parse_with_policy(input: &str, allow_utf8: bool) -> Result<Self, AddressError> {
        if !allow_utf8 && !input.is_ascii() {
            return Err(AddressError::NonAscii(input.to_string()));
        }
        Self::parse(input)
    }

    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The bare `local@domain` form, without angle brackets.
    #[must_use]
    pub fn as_smtp_string(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}@{}>", self.local, self.domain)
    }
}
