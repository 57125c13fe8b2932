//! SMTP reply codes used across the server.

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug, Serialize, Deserialize)]
pub enum Status {
    ServiceReady = 220,
    GoodBye = 221,
    AuthSuccessful = 235,
    Ok = 250,
    AuthContinue = 334,
    StartMailInput = 354,
    Unavailable = 421,
    MailboxBusy = 450,
    ActionAborted = 451,
    InsufficientStorage = 452,
    TlsUnavailable = 454,
    SyntaxError = 500,
    ParameterError = 501,
    NotImplemented = 502,
    BadSequence = 503,
    AuthFailed = 535,
    EncryptionRequired = 538,
    Rejected = 550,
    ExceededStorage = 552,
    MailboxNameInvalid = 553,
    TransactionFailed = 554,
}

impl Status {
    /// Permanent rejection (5xx).
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u16::from(self) >= 500
    }

    /// Temporary rejection (4xx).
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u16::from(self))
    }

    /// Positive completion or intermediate (2xx/3xx).
    #[must_use]
    pub fn is_positive(self) -> bool {
        u16::from(self) < 400
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        value as Self
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u16::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn permanence_classes() {
        assert!(Status::Rejected.is_permanent());
        assert!(!Status::Rejected.is_temporary());

        assert!(Status::Unavailable.is_temporary());
        assert!(!Status::Unavailable.is_permanent());

        assert!(Status::Ok.is_positive());
        assert!(Status::AuthContinue.is_positive());
    }

    #[test]
    fn numeric_conversion() {
        assert_eq!(u16::from(Status::Rejected), 550);
        assert_eq!(u16::from(Status::EncryptionRequired), 538);
        assert_eq!(Status::ServiceReady.to_string(), "220");
    }
}
