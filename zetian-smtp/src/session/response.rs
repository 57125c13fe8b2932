//! Per-command handling: policy gates, state transitions, and the reply
//! each command earns.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use zetian_common::{incoming, Address, HeaderMap, Status, TlsState};

use crate::{
    auth::{AuthFlow, AuthStep},
    command::Command,
    error::SessionError,
    extensions::{Extension, Mechanism},
    handler::{AuthResult, MessageDisposition, SealedMessage},
    reply::Reply,
    session::{io::BodyEvent, Session},
    state::State,
};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    fn smtputf8_advertised(&self) -> bool {
        self.config
            .extensions
            .iter()
            .any(|ext| matches!(ext, Extension::SmtpUtf8))
    }

    fn chunking_advertised(&self) -> bool {
        self.config
            .extensions
            .iter()
            .any(|ext| matches!(ext, Extension::Chunking))
    }

    fn auth_mechanisms(&self) -> Vec<Mechanism> {
        self.config
            .extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Auth(mechs) => Some(mechs.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Process one command line. Returns `Ok(true)` when the connection
    /// should close.
    pub(crate) async fn handle_line(&mut self, line: &str) -> Result<bool, SessionError> {
        incoming!("{line}");

        if self.auth_flow.is_some() {
            return self.continue_auth(line).await;
        }

        let advertised = self.smtputf8_advertised();
        let allow_utf8 = if line.len() >= 4 && line[..4].eq_ignore_ascii_case("MAIL") {
            advertised
        } else {
            advertised && self.tx.params.smtputf8
        };

        let command = Command::parse(line, allow_utf8);
        tracing::debug!(peer = ?self.peer, state = %self.state, command = %command, "Dispatching");

        match command {
            Command::Invalid(reason) => {
                self.record_error();
                self.send_reply(&Reply::new(
                    Status::SyntaxError,
                    format!("Syntax error: {reason}"),
                ))
                .await?;
                Ok(false)
            }

            Command::Noop => {
                self.send_reply(&Reply::new(Status::Ok, "Ok")).await?;
                Ok(false)
            }

            Command::Help => {
                self.send_reply(&Reply::multiline(
                    Status::Ok,
                    vec![
                        "Supported commands:".to_string(),
                        "EHLO HELO MAIL RCPT DATA BDAT RSET NOOP QUIT VRFY STARTTLS AUTH HELP"
                            .to_string(),
                    ],
                ))
                .await?;
                Ok(false)
            }

            Command::Vrfy(_) => {
                self.send_reply(&Reply::new(
                    Status::NotImplemented,
                    "VRFY not available",
                ))
                .await?;
                Ok(false)
            }

            Command::Quit => {
                self.send_reply(&Reply::new(
                    Status::GoodBye,
                    format!("{} closing transmission channel", self.config.banner),
                ))
                .await?;
                Ok(true)
            }

            Command::StartTls => self.handle_starttls().await,

            Command::Auth { mechanism, initial } => {
                self.handle_auth(&mechanism, initial.as_deref()).await
            }

            Command::MailFrom(sender, params) => {
                if self.state.greeted() && !self.state.in_transaction() {
                    if self.config.require_secure_connection && !self.connection.is_tls() {
                        self.send_reply(&Reply::new(
                            Status::Rejected,
                            "Must issue a STARTTLS command first",
                        ))
                        .await?;
                        return Ok(false);
                    }

                    if self.config.require_authentication && self.authenticated.is_none() {
                        self.send_reply(&Reply::new(
                            Status::Rejected,
                            "Authentication required",
                        ))
                        .await?;
                        return Ok(false);
                    }

                    if let Some(declared) = params.size {
                        if self.max_message_size > 0 && declared > self.max_message_size {
                            self.send_reply(&Reply::new(
                                Status::ExceededStorage,
                                format!(
                                    "Declared size {declared} exceeds maximum {}",
                                    self.max_message_size
                                ),
                            ))
                            .await?;
                            return Ok(false);
                        }
                    }
                }

                self.apply_transition(Command::MailFrom(sender, params), |_| {
                    Reply::new(Status::Ok, "Ok")
                })
                .await
            }

            Command::RcptTo(recipient) => self.handle_rcpt(recipient).await,

            Command::Data => self.handle_data().await,

            Command::Bdat { size, last } => self.handle_bdat(size, last).await,

            cmd @ (Command::Helo(_) | Command::Rset) => {
                // Any buffered BDAT chunks die with the transaction
                self.body.clear();
                let banner = self.config.banner.clone();
                let is_rset = matches!(cmd, Command::Rset);
                let capabilities = self.capability_lines();
                self.apply_transition(cmd, move |state| match state {
                    _ if is_rset => Reply::new(Status::Ok, "Ok"),
                    State::Ehlo(_) => Reply::multiline(Status::Ok, capabilities.clone()),
                    State::Helo(ehlo) => {
                        Reply::new(Status::Ok, format!("{banner} says hello to {}", ehlo.id))
                    }
                    _ => Reply::new(Status::Ok, "Ok"),
                })
                .await
            }
        }
    }

    /// EHLO response lines: hostname first, then one keyword per line.
    fn capability_lines(&self) -> Vec<String> {
        let tls_active = self.connection.is_tls();
        let mut lines = vec![self.config.banner.clone()];
        lines.extend(
            self.config
                .extensions
                .iter()
                .filter_map(|ext| ext.keyword(tls_active, self.config.allow_plaintext_auth)),
        );
        lines
    }

    /// Feed the machine; an invalid transition replies 503 and leaves
    /// the current state untouched so the session can recover.
    async fn apply_transition<F>(&mut self, command: Command, reply_for: F) -> Result<bool, SessionError>
    where
        F: FnOnce(&State) -> Reply,
    {
        let next = self.state.clone().transition(command, &mut self.tx);

        if let State::Invalid(ref invalid) = next {
            self.record_error();
            self.send_reply(&Reply::new(Status::BadSequence, invalid.reason.clone()))
                .await?;
            return Ok(false);
        }

        self.consecutive_errors = 0;
        self.state = next;
        let reply = reply_for(&self.state);
        self.send_reply(&reply).await?;
        Ok(false)
    }

    async fn handle_rcpt(&mut self, recipient: Address) -> Result<bool, SessionError> {
        if !matches!(self.state, State::MailFrom(_) | State::RcptTo(_)) {
            self.record_error();
            self.send_reply(&Reply::new(Status::BadSequence, "Need MAIL command first"))
                .await?;
            return Ok(false);
        }

        if self.tx.recipients.len() >= self.config.max_recipients {
            self.send_reply(&Reply::new(
                Status::InsufficientStorage,
                "Too many recipients",
            ))
            .await?;
            return Ok(false);
        }

        let decision = self
            .handler
            .relay_allowed(
                &recipient,
                recipient.domain(),
                self.peer.ip(),
                self.authenticated.is_some(),
            )
            .await;

        if decision == crate::handler::RelayDecision::Denied {
            self.send_reply(&Reply::new(Status::Rejected, "relay denied"))
                .await?;
            return Ok(false);
        }

        self.apply_transition(Command::RcptTo(recipient), |_| {
            Reply::new(Status::Ok, "Ok")
        })
        .await
    }

    async fn handle_starttls(&mut self) -> Result<bool, SessionError> {
        if self.connection.is_tls() {
            self.record_error();
            self.send_reply(&Reply::new(Status::BadSequence, "Already using TLS"))
                .await?;
            return Ok(false);
        }

        if self.state.in_transaction() {
            self.record_error();
            self.send_reply(&Reply::new(
                Status::BadSequence,
                "STARTTLS not allowed during mail transaction",
            ))
            .await?;
            return Ok(false);
        }

        let Some(tls_context) = self.tls_context.clone() else {
            self.send_reply(&Reply::new(Status::NotImplemented, "TLS not available"))
                .await?;
            return Ok(false);
        };

        self.send_reply(&Reply::new(Status::ServiceReady, "Ready to start TLS"))
            .await?;

        // Replace the connection in place; on upgrade failure the
        // session ends and the placeholder is never used again.
        let connection = std::mem::replace(
            &mut self.connection,
            crate::connection::Connection::placeholder(),
        );

        match connection.upgrade(&tls_context).await {
            Ok((upgraded, info)) => {
                tracing::debug!(
                    proto = %info.proto(),
                    cipher = %info.cipher(),
                    "Connection upgraded"
                );
                self.connection = upgraded;
                // RFC 3207: prior knowledge is discarded, EHLO required
                self.state = State::default();
                self.tx = crate::state::Transaction::default();
                self.authenticated = None;
                self.auth_flow = None;
                self.line_buf.clear();
                self.consecutive_errors = 0;
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(peer = ?self.peer, "TLS handshake failed: {e}");
                Err(SessionError::Protocol(format!("TLS handshake failed: {e}")))
            }
        }
    }

    async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial: Option<&str>,
    ) -> Result<bool, SessionError> {
        if self.authenticated.is_some() {
            self.record_error();
            self.send_reply(&Reply::new(Status::BadSequence, "Already authenticated"))
                .await?;
            return Ok(false);
        }

        if self.state.in_transaction() {
            self.record_error();
            self.send_reply(&Reply::new(
                Status::BadSequence,
                "AUTH not allowed during mail transaction",
            ))
            .await?;
            return Ok(false);
        }

        let mechanisms = self.auth_mechanisms();
        let mech = match mechanism {
            "PLAIN" => Mechanism::Plain,
            "LOGIN" => Mechanism::Login,
            _ => {
                self.send_reply(&Reply::new(
                    Status::ParameterError,
                    "Unrecognized authentication mechanism",
                ))
                .await?;
                return Ok(false);
            }
        };

        if !mechanisms.contains(&mech) {
            self.send_reply(&Reply::new(
                Status::ParameterError,
                "Mechanism not advertised",
            ))
            .await?;
            return Ok(false);
        }

        if !self.connection.is_tls() && !self.config.allow_plaintext_auth {
            self.send_reply(&Reply::new(
                Status::EncryptionRequired,
                "Encryption required for requested authentication mechanism",
            ))
            .await?;
            return Ok(false);
        }

        let (flow, step) = AuthFlow::start(mech, initial);
        if let Some(flow) = flow {
            self.auth_flow = Some((mech, flow));
        }
        self.finish_auth_step(mech, step).await
    }

    async fn continue_auth(&mut self, line: &str) -> Result<bool, SessionError> {
        let Some((mech, mut flow)) = self.auth_flow.take() else {
            return Ok(false);
        };
        let step = flow.advance(line);
        if matches!(step, AuthStep::Challenge(_)) {
            self.auth_flow = Some((mech, flow));
        }
        self.finish_auth_step(mech, step).await
    }

    async fn finish_auth_step(
        &mut self,
        mech: Mechanism,
        step: AuthStep,
    ) -> Result<bool, SessionError> {
        match step {
            AuthStep::Challenge(challenge) => {
                self.send_reply(&Reply::new(Status::AuthContinue, challenge))
                    .await?;
            }
            AuthStep::Cancelled => {
                self.auth_flow = None;
                self.send_reply(&Reply::new(
                    Status::ParameterError,
                    "Authentication cancelled",
                ))
                .await?;
            }
            AuthStep::Malformed => {
                self.auth_flow = None;
                self.record_error();
                self.send_reply(&Reply::new(
                    Status::ParameterError,
                    "Malformed authentication response",
                ))
                .await?;
            }
            AuthStep::Done { identity, secret } => {
                self.auth_flow = None;
                match self.handler.on_authenticate(mech, &identity, &secret).await {
                    AuthResult::Accepted(bound) => {
                        self.authenticated = Some(bound);
                        self.consecutive_errors = 0;
                        self.send_reply(&Reply::new(
                            Status::AuthSuccessful,
                            "Authentication successful",
                        ))
                        .await?;
                    }
                    AuthResult::Rejected => {
                        self.send_reply(&Reply::new(
                            Status::AuthFailed,
                            "Authentication credentials invalid",
                        ))
                        .await?;
                    }
                }
            }
        }
        Ok(false)
    }

    async fn handle_data(&mut self) -> Result<bool, SessionError> {
        let next = self.state.clone().transition(Command::Data, &mut self.tx);

        if let State::Invalid(ref invalid) = next {
            self.record_error();
            self.send_reply(&Reply::new(Status::BadSequence, invalid.reason.clone()))
                .await?;
            return Ok(false);
        }
        self.state = next;
        self.consecutive_errors = 0;

        self.send_reply(&Reply::new(
            Status::StartMailInput,
            "Start mail input; end with <CRLF>.<CRLF>",
        ))
        .await?;

        match self.read_data_body().await? {
            BodyEvent::Eof => Ok(true),
            BodyEvent::Oversize => {
                self.send_reply(&Reply::new(
                    Status::ExceededStorage,
                    format!(
                        "Message exceeds maximum size of {} bytes",
                        self.max_message_size
                    ),
                ))
                .await?;
                self.reset_after_message();
                Ok(false)
            }
            BodyEvent::Complete(body) => {
                self.seal_and_dispatch(body).await?;
                Ok(false)
            }
        }
    }

    async fn handle_bdat(&mut self, size: usize, last: bool) -> Result<bool, SessionError> {
        if !self.chunking_advertised() {
            self.record_error();
            self.send_reply(&Reply::new(Status::NotImplemented, "CHUNKING not available"))
                .await?;
            return Ok(false);
        }

        let next = self
            .state
            .clone()
            .transition(Command::Bdat { size, last }, &mut self.tx);

        if let State::Invalid(ref invalid) = next {
            // The chunk bytes are already on the wire; consume them so
            // the stream stays in sync before rejecting
            let _ = self.read_bdat_chunk(size).await?;
            self.record_error();
            self.send_reply(&Reply::new(Status::BadSequence, invalid.reason.clone()))
                .await?;
            return Ok(false);
        }
        self.state = next;
        self.consecutive_errors = 0;

        let Some(chunk) = self.read_bdat_chunk(size).await? else {
            return Ok(true);
        };
        self.body.extend_from_slice(&chunk);

        if self.max_message_size > 0 && self.body.len() > self.max_message_size {
            self.send_reply(&Reply::new(
                Status::ExceededStorage,
                format!(
                    "Message exceeds maximum size of {} bytes",
                    self.max_message_size
                ),
            ))
            .await?;
            self.reset_after_message();
            return Ok(false);
        }

        if last {
            let body = std::mem::take(&mut self.body);
            self.seal_and_dispatch(body).await?;
        } else {
            self.send_reply(&Reply::new(
                Status::Ok,
                format!("{size} octets received"),
            ))
            .await?;
        }

        Ok(false)
    }

    fn reset_after_message(&mut self) {
        self.body.clear();
        self.tx.clear();
        self.state = self.tx.ready_state();
    }

    /// Build the envelope, hand the message over, and answer the client.
    async fn seal_and_dispatch(&mut self, body: Vec<u8>) -> Result<(), SessionError> {
        let headers = HeaderMap::parse(&body);
        let tls_state = if self.connection.is_tls() {
            TlsState::Inbound
        } else {
            TlsState::None
        };

        let envelope = zetian_common::Envelope::builder()
            .from(self.tx.from.clone())
            .recipients(self.tx.recipients.clone())
            .size_bytes(body.len())
            .remote_ip(self.peer.ip())
            .authenticated_identity(self.authenticated.clone())
            .ehlo_name(self.tx.helo_id.clone())
            .tls_state(tls_state)
            .headers(headers)
            .seal();

        let envelope_id = envelope.id();
        let info = self.session_info();
        let message = SealedMessage {
            envelope,
            body: Arc::from(body),
        };

        let disposition = self.handler.on_message(message, &info).await;

        let reply = match disposition {
            MessageDisposition::Accepted => {
                self.messages_accepted += 1;
                Reply::new(Status::Ok, format!("Queued as {envelope_id}"))
            }
            MessageDisposition::Rejected { reason } => Reply::new(Status::Rejected, reason),
            MessageDisposition::TempFailed { reason } => {
                Reply::new(Status::ActionAborted, reason)
            }
        };

        self.send_reply(&reply).await?;
        self.reset_after_message();
        Ok(())
    }
}
