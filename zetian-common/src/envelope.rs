//! The accepted message unit: metadata plus a handle to the stored body.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{address::Address, headers::HeaderMap};

/// Unique envelope identifier, minted when DATA completes.
///
/// ULIDs are lexicographically sortable by creation time, which the
/// queue's FIFO-within-priority ordering relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(ulid::Ulid);

impl EnvelopeId {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle into a `MessageStore` body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BodyRef(String);

impl BodyRef {
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BodyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TLS posture of the session that produced an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsState {
    #[default]
    None,
    /// The inbound hop was TLS-protected.
    Inbound,
    /// Both the inbound hop and the planned outbound hop require TLS.
    BothDirections,
}

/// Immutable once sealed by the session engine at DATA completion.
///
/// `from: None` is the null sender (`MAIL FROM:<>`), which marks bounces
/// and must never itself be bounced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    from: Option<Address>,
    recipients: Vec<Address>,
    size_bytes: usize,
    received_at: DateTime<Utc>,
    remote_ip: IpAddr,
    authenticated_identity: Option<String>,
    ehlo_name: String,
    tls_state: TlsState,
    headers: HeaderMap,
    body_ref: BodyRef,
}

impl Envelope {
    #[must_use]
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::default()
    }

    #[must_use]
    pub const fn id(&self) -> EnvelopeId {
        self.id
    }

    #[must_use]
    pub const fn from(&self) -> Option<&Address> {
        self.from.as_ref()
    }

    /// True for `MAIL FROM:<>` envelopes (bounces, DSNs).
    #[must_use]
    pub const fn is_null_sender(&self) -> bool {
        self.from.is_none()
    }

    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    #[must_use]
    pub const fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    #[must_use]
    pub fn authenticated_identity(&self) -> Option<&str> {
        self.authenticated_identity.as_deref()
    }

    #[must_use]
    pub fn ehlo_name(&self) -> &str {
        &self.ehlo_name
    }

    #[must_use]
    pub const fn tls_state(&self) -> TlsState {
        self.tls_state
    }

    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub const fn body_ref(&self) -> &BodyRef {
        &self.body_ref
    }

    /// Derive a copy with extra headers prepended.
    ///
    /// The envelope itself stays immutable; verdict actions that tag a
    /// message (`X-Spam-*`) produce a derived envelope before persisting.
    #[must_use]
    pub fn with_prepended_headers<I, K, V>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        // Prepend in reverse so iteration order is preserved at the front
        let extra: Vec<(String, String)> = extra
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        for (name, value) in extra.into_iter().rev() {
            self.headers.prepend(name, value);
        }
        self
    }
}

/// Builder used by the session engine while a transaction accumulates.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    from: Option<Address>,
    recipients: Vec<Address>,
    size_bytes: usize,
    remote_ip: IpAddr,
    authenticated_identity: Option<String>,
    ehlo_name: String,
    tls_state: TlsState,
    headers: HeaderMap,
    body_ref: Option<BodyRef>,
}

impl Default for EnvelopeBuilder {
    fn default() -> Self {
        Self {
            from: None,
            recipients: Vec::new(),
            size_bytes: 0,
            remote_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            authenticated_identity: None,
            ehlo_name: String::new(),
            tls_state: TlsState::None,
            headers: HeaderMap::new(),
            body_ref: None,
        }
    }
}

impl EnvelopeBuilder {
    #[must_use]
    pub fn from(mut self, from: Option<Address>) -> Self {
        self.from = from;
        self
    }

    #[must_use]
    pub fn recipients(mut self, recipients: Vec<Address>) -> Self {
        self.recipients = recipients;
        self
    }

    #[must_use]
    pub const fn size_bytes(mut self, size: usize) -> Self {
        self.size_bytes = size;
        self
    }

    #[must_use]
    pub const fn remote_ip(mut self, ip: IpAddr) -> Self {
        self.remote_ip = ip;
        self
    }

    #[must_use]
    pub fn authenticated_identity(mut self, identity: Option<String>) -> Self {
        self.authenticated_identity = identity;
        self
    }

    #[must_use]
    pub fn ehlo_name(mut self, name: impl Into<String>) -> Self {
        self.ehlo_name = name.into();
        self
    }

    #[must_use]
    pub const fn tls_state(mut self, state: TlsState) -> Self {
        self.tls_state = state;
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn body_ref(mut self, body_ref: BodyRef) -> Self {
        self.body_ref = Some(body_ref);
        self
    }

    /// Seal the envelope, minting its id and timestamp.
    #[must_use]
    pub fn seal(self) -> Envelope {
        let id = EnvelopeId::generate();
        let body_ref = self
            .body_ref
            .unwrap_or_else(|| BodyRef::new(id.to_string()));
        Envelope {
            id,
            from: self.from,
            recipients: self.recipients,
            size_bytes: self.size_bytes,
            received_at: Utc::now(),
            remote_ip: self.remote_ip,
            authenticated_identity: self.authenticated_identity,
            ehlo_name: self.ehlo_name,
            tls_state: self.tls_state,
            headers: self.headers,
            body_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::builder()
            .from(Some(Address::parse("<a@x.example>").unwrap()))
            .recipients(vec![Address::parse("<u@local.example>").unwrap()])
            .size_bytes(42)
            .ehlo_name("client.example")
            .headers(HeaderMap::parse(b"Subject: hi\r\n\r\n"))
            .seal()
    }

    #[test]
    fn seal_mints_id_and_body_ref() {
        let a = sample();
        let b = sample();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.body_ref().as_str(), a.id().to_string());
    }

    #[test]
    fn null_sender_detection() {
        let bounce = Envelope::builder()
            .recipients(vec![Address::parse("<a@x.example>").unwrap()])
            .seal();
        assert!(bounce.is_null_sender());
        assert!(!sample().is_null_sender());
    }

    #[test]
    fn prepended_headers_keep_order() {
        let tagged = sample().with_prepended_headers(vec![
            ("X-Spam-Flag", "YES"),
            ("X-Spam-Score", "7.2"),
        ]);
        let wire = tagged.headers().to_wire();
        let flag = wire.find("X-Spam-Flag").unwrap();
        let score = wire.find("X-Spam-Score").unwrap();
        let subject = wire.find("Subject").unwrap();
        assert!(flag < score && score < subject);
    }
}
