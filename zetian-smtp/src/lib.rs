pub mod auth;
pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod handler;
pub mod listener;
pub mod reply;
pub mod session;
pub mod state;

pub use command::{Command, HeloVariant, MailParameters};
pub use extensions::{Extension, Mechanism, TlsContext};
pub use handler::{
    AcceptAll, AuthResult, MailHandler, MessageDisposition, RelayDecision, SealedMessage,
};
pub use listener::{Listener, ListenerConfig};
pub use reply::Reply;
pub use session::{Session, SessionConfig, SessionOutcome};
pub use state::State;

use serde::Deserialize;

/// SMTP server-side timeout configuration
///
/// These timeouts prevent resource exhaustion from slow or malicious
/// clients and follow RFC 5321 Section 4.5.3.2 recommendations.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct SmtpServerTimeouts {
    /// Timeout for regular SMTP commands (EHLO, MAIL FROM, RCPT TO, etc.)
    ///
    /// RFC 5321 recommends 5 minutes.
    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,

    /// Timeout between data chunks while receiving a message body
    ///
    /// RFC 5321 recommends 3 minutes.
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// Maximum total session duration
    #[serde(default = "default_connection_timeout")]
    pub connection_secs: u64,
}

impl Default for SmtpServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            connection_secs: default_connection_timeout(),
        }
    }
}

const fn default_command_timeout() -> u64 {
    300 // 5 minutes per RFC 5321
}

const fn default_data_timeout() -> u64 {
    180 // 3 minutes per RFC 5321
}

const fn default_connection_timeout() -> u64 {
    1800 // 30 minutes
}

/// Maximum SMTP command line length, CRLF included (RFC 5321 4.5.3.1.4).
pub const MAX_COMMAND_LINE: usize = 512;

/// Consecutive protocol-syntax faults tolerated before the session gives
/// up with a 421.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;
