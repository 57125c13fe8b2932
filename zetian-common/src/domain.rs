//! Domain newtype for type safety
//!
//! Wraps domain strings to prevent accidentally passing email addresses
//! or other strings where domains are expected.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A domain name string wrapper.
///
/// Comparison and hashing are done on the ASCII-lowercased form so that
/// `Example.COM` and `example.com` are the same routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(Arc::from(s.as_ref().to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` equals `other` or is a subdomain of it.
    #[must_use]
    pub fn is_subdomain_of(&self, other: &Self) -> bool {
        self == other
            || (self.0.len() > other.0.len()
                && self.0.ends_with(other.0.as_ref())
                && self.0.as_bytes()[self.0.len() - other.0.len() - 1] == b'.')
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_on_construction() {
        assert_eq!(Domain::new("Example.COM").as_str(), "example.com");
        assert_eq!(Domain::new("Example.COM"), Domain::new("example.com"));
    }

    #[test]
    fn subdomain_matching() {
        let parent = Domain::new("example.com");
        assert!(Domain::new("example.com").is_subdomain_of(&parent));
        assert!(Domain::new("mail.example.com").is_subdomain_of(&parent));
        assert!(Domain::new("a.b.example.com").is_subdomain_of(&parent));
        assert!(!Domain::new("notexample.com").is_subdomain_of(&parent));
        assert!(!Domain::new("example.org").is_subdomain_of(&parent));
    }

    #[test]
    fn serde_transparent() {
        let domain = Domain::new("serde.example.com");
        let serialized = serde_json::to_string(&domain).unwrap();
        assert_eq!(serialized, "\"serde.example.com\"");
        let back: Domain = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back, domain);
    }
}
