//! One session per inbound connection.
//!
//! The session runs the ESMTP state machine over a buffered stream,
//! enforcing the line discipline, timeouts, and policy gates, and hands
//! completed messages to the embedding server's `MailHandler`.

mod io;
mod response;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use zetian_common::{internal, Signal, SessionInfo, SessionRegistryRecord, TlsState};

use crate::{
    auth::AuthFlow,
    connection::Connection,
    error::SessionError,
    extensions::{Extension, TlsContext},
    handler::MailHandler,
    reply::Reply,
    state::{State, Transaction},
    SmtpServerTimeouts,
};

/// Static configuration for a session, shared by the listener.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub extensions: Vec<Extension>,
    /// Hostname used in the banner and EHLO response.
    pub banner: String,
    /// Free text after the hostname in the 220 greeting.
    pub greeting: String,
    pub timeouts: SmtpServerTimeouts,
    pub max_recipients: usize,
    pub require_authentication: bool,
    pub require_secure_connection: bool,
    pub allow_plaintext_auth: bool,
    /// Identity of this node, recorded in session registry records.
    pub node_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            extensions: vec![
                Extension::Pipelining,
                Extension::EightBitMime,
                Extension::Size(0),
                Extension::EnhancedStatusCodes,
            ],
            banner: "localhost".to_string(),
            greeting: "ESMTP Zetian ready".to_string(),
            timeouts: SmtpServerTimeouts::default(),
            max_recipients: 100,
            require_authentication: false,
            require_secure_connection: false,
            allow_plaintext_auth: true,
            node_id: String::new(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder(Self::default())
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder(SessionConfig);

impl SessionConfigBuilder {
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<Extension>) -> Self {
        self.0.extensions = extensions;
        self
    }

    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.0.banner = banner.into();
        self
    }

    #[must_use]
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.0.greeting = greeting.into();
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SmtpServerTimeouts) -> Self {
        self.0.timeouts = timeouts;
        self
    }

    #[must_use]
    pub const fn with_max_recipients(mut self, max: usize) -> Self {
        self.0.max_recipients = max;
        self
    }

    #[must_use]
    pub const fn with_require_authentication(mut self, required: bool) -> Self {
        self.0.require_authentication = required;
        self
    }

    #[must_use]
    pub const fn with_require_secure_connection(mut self, required: bool) -> Self {
        self.0.require_secure_connection = required;
        self
    }

    #[must_use]
    pub const fn with_allow_plaintext_auth(mut self, allowed: bool) -> Self {
        self.0.allow_plaintext_auth = allowed;
        self
    }

    #[must_use]
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.0.node_id = node_id.into();
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        self.0
    }
}

/// What happened over the lifetime of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub messages_accepted: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    pub(crate) peer: SocketAddr,
    pub(crate) connection: Connection<Stream>,
    pub(crate) config: SessionConfig,
    pub(crate) handler: Arc<dyn MailHandler>,

    pub(crate) state: State,
    pub(crate) tx: Transaction,
    pub(crate) authenticated: Option<String>,
    pub(crate) auth_flow: Option<(crate::extensions::Mechanism, AuthFlow)>,

    pub(crate) session_id: String,
    pub(crate) started_at: chrono::DateTime<Utc>,
    start_instant: std::time::Instant,

    // Wire discipline
    pub(crate) line_buf: Vec<u8>,
    pub(crate) discard_overlong: bool,
    pub(crate) body: Vec<u8>,
    pub(crate) consecutive_errors: u32,

    pub(crate) tls_context: Option<TlsContext>,
    pub(crate) max_message_size: usize,

    pub(crate) bytes_in: u64,
    pub(crate) bytes_out: u64,
    pub(crate) messages_accepted: u32,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn new(
        stream: Stream,
        peer: SocketAddr,
        config: SessionConfig,
        handler: Arc<dyn MailHandler>,
    ) -> Self {
        let max_message_size = config
            .extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Size(size) => Some(*size),
                _ => None,
            })
            .unwrap_or(0);

        let tls_context = config.extensions.iter().find_map(|ext| match ext {
            Extension::Starttls(context) => Some(context.clone()),
            _ => None,
        });

        Self {
            peer,
            connection: Connection::plain(stream),
            config,
            handler,
            state: State::default(),
            tx: Transaction::default(),
            authenticated: None,
            auth_flow: None,
            session_id: ulid::Ulid::new().to_string(),
            started_at: Utc::now(),
            start_instant: std::time::Instant::now(),
            line_buf: Vec::new(),
            discard_overlong: false,
            body: Vec::new(),
            consecutive_errors: 0,
            tls_context,
            max_message_size,
            bytes_in: 0,
            bytes_out: 0,
            messages_accepted: 0,
        }
    }

    pub(crate) fn registry_record(&self) -> SessionRegistryRecord {
        SessionRegistryRecord {
            session_id: self.session_id.clone(),
            owner_node_id: self.config.node_id.clone(),
            remote_ip: self.peer.ip(),
            started_at: self.started_at,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            message_count: self.messages_accepted,
            affinity_key: None,
        }
    }

    pub(crate) fn session_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            remote_ip: self.peer.ip(),
            started_at: self.started_at,
            ehlo_name: self.tx.helo_id.clone(),
            tls_state: if self.connection.is_tls() {
                TlsState::Inbound
            } else {
                TlsState::None
            },
            authenticated_identity: self.authenticated.clone(),
        }
    }

    pub(crate) async fn send_reply(&mut self, reply: &Reply) -> Result<(), SessionError> {
        let wire = reply.to_wire();
        zetian_common::outgoing!("{}", wire.trim_end());
        self.bytes_out += wire.len() as u64;
        self.connection.send(wire.as_bytes()).await?;
        self.connection.flush().await?;
        Ok(())
    }

    /// Drive the session to completion.
    pub async fn run(
        mut self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<SessionOutcome, SessionError> {
        internal!("Session {} connected from {}", self.session_id, self.peer);

        let record = self.registry_record();
        self.handler.on_session_start(&record).await;

        let result = self.run_inner(&mut signal).await;

        let record = self.registry_record();
        self.handler.on_session_end(&record).await;
        internal!("Session {} closed", self.session_id);

        let outcome = SessionOutcome {
            messages_accepted: self.messages_accepted,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
        };

        result.map(|()| outcome)
    }

    async fn run_inner(
        &mut self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let greeting = Reply::new(
            zetian_common::Status::ServiceReady,
            format!("{} {}", self.config.banner, self.config.greeting),
        );
        self.send_reply(&greeting).await?;

        loop {
            let elapsed = self.start_instant.elapsed();
            let max_duration = Duration::from_secs(self.config.timeouts.connection_secs);
            if elapsed >= max_duration {
                tracing::warn!(
                    peer = ?self.peer,
                    duration_secs = elapsed.as_secs(),
                    "Connection exceeded maximum lifetime, closing"
                );
                let reply = Reply::new(
                    zetian_common::Status::Unavailable,
                    "Connection lifetime exceeded, closing",
                );
                let _ = self.send_reply(&reply).await;
                return Err(SessionError::Timeout(self.config.timeouts.connection_secs));
            }

            let timeout = Duration::from_secs(self.config.timeouts.command_secs);

            let event = tokio::select! {
                sig = signal.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        let reply = Reply::new(
                            zetian_common::Status::Unavailable,
                            "Server shutting down",
                        );
                        let _ = self.send_reply(&reply).await;
                        return Ok(());
                    }
                    continue;
                }
                read = tokio::time::timeout(timeout, self.read_line()) => {
                    match read {
                        Ok(event) => event?,
                        Err(_) => {
                            tracing::warn!(
                                peer = ?self.peer,
                                state = %self.state,
                                timeout_secs = timeout.as_secs(),
                                "Client connection timed out"
                            );
                            let reply = Reply::new(
                                zetian_common::Status::Unavailable,
                                "Command timeout, closing connection",
                            );
                            let _ = self.send_reply(&reply).await;
                            return Err(SessionError::Timeout(timeout.as_secs()));
                        }
                    }
                }
            };

            let line = match event {
                io::LineEvent::Eof => return Ok(()),
                io::LineEvent::Overlong => {
                    let reply =
                        Reply::new(zetian_common::Status::SyntaxError, "Line too long");
                    self.send_reply(&reply).await?;
                    if self.record_error() {
                        return self.give_up().await;
                    }
                    continue;
                }
                io::LineEvent::Line(line) => line,
            };

            if self.handle_line(&line).await? {
                return Ok(());
            }

            if self.consecutive_errors >= crate::MAX_CONSECUTIVE_ERRORS {
                return self.give_up().await;
            }
        }
    }

    /// Count a protocol-syntax fault. Returns true once the threshold
    /// has been crossed.
    pub(crate) fn record_error(&mut self) -> bool {
        self.consecutive_errors += 1;
        self.consecutive_errors >= crate::MAX_CONSECUTIVE_ERRORS
    }

    async fn give_up(&mut self) -> Result<(), SessionError> {
        let reply = Reply::new(
            zetian_common::Status::Unavailable,
            "Too many errors, closing connection",
        );
        let _ = self.send_reply(&reply).await;
        Err(SessionError::Protocol(
            "Too many consecutive protocol errors".to_string(),
        ))
    }
}
