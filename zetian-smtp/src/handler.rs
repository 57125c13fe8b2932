//! The contract between the session engine and the embedding server.
//!
//! The session owns the wire protocol; everything with policy or
//! persistence behind it goes through a `MailHandler`. The zetian server
//! crate implements this to run the anti-abuse pipeline, persist bodies,
//! and feed the relay queue.

use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use zetian_common::{Address, Domain, Envelope, SessionInfo, SessionRegistryRecord};

use crate::extensions::Mechanism;

/// What the session should answer to a RCPT TO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    /// Recipient domain is local; delivery bypasses the outbound queue.
    Local,
    /// Relaying is authorized.
    Relay,
    /// `550 relay denied`.
    Denied,
}

/// Result of validating SASL credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Bind this identity to the session.
    Accepted(String),
    /// `535`.
    Rejected,
}

/// A completed message: the sealed envelope plus its raw body bytes.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    pub envelope: Envelope,
    pub body: Arc<[u8]>,
}

/// Reply the handler wants for a completed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDisposition {
    /// `250 Queued` (covers Mark and Quarantine verdicts too).
    Accepted,
    /// `550 {reason}`; nothing was persisted.
    Rejected { reason: String },
    /// `451 {reason}`; client retries later (greylisting lands here).
    TempFailed { reason: String },
}

/// Callbacks the embedding server provides to every session.
///
/// All methods have permissive defaults so protocol tests can run with a
/// unit handler.
#[async_trait]
pub trait MailHandler: Send + Sync {
    /// Called once the session is established, before the banner.
    async fn on_session_start(&self, _record: &SessionRegistryRecord) {}

    /// Called when the session ends, however it ends.
    async fn on_session_end(&self, _record: &SessionRegistryRecord) {}

    /// RCPT-time relay authorization.
    async fn relay_allowed(
        &self,
        _recipient: &Address,
        _domain: &Domain,
        _remote_ip: IpAddr,
        _authenticated: bool,
    ) -> RelayDecision {
        RelayDecision::Relay
    }

    /// Validate SASL credentials.
    async fn on_authenticate(
        &self,
        _mechanism: Mechanism,
        _identity: &str,
        _secret: &str,
    ) -> AuthResult {
        AuthResult::Rejected
    }

    /// Score, persist, and queue a completed message.
    async fn on_message(&self, _message: SealedMessage, _info: &SessionInfo)
        -> MessageDisposition {
        MessageDisposition::Accepted
    }
}

/// Accept-everything handler for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl MailHandler for AcceptAll {}
