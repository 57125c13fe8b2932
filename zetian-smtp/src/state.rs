//! Typed session state machine.
//!
//! Each protocol state is its own struct, wrapped in the `State` enum for
//! dispatch. `transition` enforces command sequencing only; policy checks
//! (relay authorization, authentication requirements, caps) happen in the
//! session before a command reaches the machine.

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use zetian_common::address::Address;

use crate::command::{Command, HeloVariant, MailParameters};

/// Session context the machine records into: the greeting identity plus
/// the accumulating mail transaction. RSET and message completion clear
/// the transaction but keep the greeting.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub helo_id: String,
    pub extended: bool,
    pub from: Option<Address>,
    pub params: MailParameters,
    pub recipients: Vec<Address>,
}

impl Transaction {
    pub fn clear(&mut self) {
        self.from = None;
        self.params = MailParameters::default();
        self.recipients.clear();
    }

    /// The ready state matching the recorded greeting.
    #[must_use]
    pub fn ready_state(&self) -> State {
        if self.extended {
            State::Ehlo(Ehlo {
                id: self.helo_id.clone(),
            })
        } else if self.helo_id.is_empty() {
            State::Connect(Connect)
        } else {
            State::Helo(Helo {
                id: self.helo_id.clone(),
            })
        }
    }
}

/// Initial connection state, greeting sent, EHLO/HELO pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect;

/// After successful EHLO (extended SMTP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ehlo {
    pub id: String,
}

/// After successful HELO (basic SMTP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Helo {
    pub id: String,
}

/// After MAIL FROM (transaction open)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailFrom;

/// At least one accepted recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcptTo;

/// DATA accepted, 354 sent, body bytes follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading;

/// Mid BDAT chunk sequence (RFC 3030); DATA is forbidden until RSET
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunking;

/// Message complete, disposition pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDot;

/// Client issued QUIT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quit;

/// Command was invalid in the current state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalid {
    pub reason: String,
}

/// Connection closing (server-initiated)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Connect(Connect),
    Ehlo(Ehlo),
    Helo(Helo),
    MailFrom(MailFrom),
    RcptTo(RcptTo),
    Reading(Reading),
    Chunking(Chunking),
    PostDot(PostDot),
    Quit(Quit),
    Invalid(Invalid),
    Close(Close),
}

impl Default for State {
    fn default() -> Self {
        Self::Connect(Connect)
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Connect(_) => "Connect",
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
            Self::MailFrom(_) => "MAIL",
            Self::RcptTo(_) => "RCPT",
            Self::Reading(_) | Self::Chunking(_) => "DATA",
            Self::PostDot(_) => "",
            Self::Quit(_) => "QUIT",
            Self::Invalid(_) => "INVALID",
            Self::Close(_) => "Close",
        })
    }
}

impl State {
    /// Advance the machine on a received command, recording transaction
    /// data as a side effect.
    ///
    /// Commands the session handles out-of-band (NOOP, HELP, VRFY,
    /// STARTTLS, AUTH, QUIT, RSET) either pass through here or are
    /// intercepted earlier; the match below still covers them so the
    /// sequencing rules live in one place.
    #[must_use]
    pub fn transition(self, command: Command, tx: &mut Transaction) -> Self {
        match (self, command) {
            (Self::Connect(_) | Self::Ehlo(_) | Self::Helo(_) | Self::PostDot(_), Command::Helo(variant)) => {
                tx.clear();
                match variant {
                    HeloVariant::Ehlo(id) => {
                        tx.helo_id.clone_from(&id);
                        tx.extended = true;
                        Self::Ehlo(Ehlo { id })
                    }
                    HeloVariant::Helo(id) => {
                        tx.helo_id.clone_from(&id);
                        tx.extended = false;
                        Self::Helo(Helo { id })
                    }
                }
            }

            // A new transaction opens from any ready state
            (
                Self::Ehlo(_) | Self::Helo(_) | Self::PostDot(_),
                Command::MailFrom(sender, params),
            ) => {
                tx.from = sender;
                tx.params = params;
                tx.recipients.clear();
                Self::MailFrom(MailFrom)
            }

            (Self::MailFrom(_) | Self::RcptTo(_), Command::RcptTo(recipient)) => {
                tx.recipients.push(recipient);
                Self::RcptTo(RcptTo)
            }

            // DATA needs at least one accepted recipient
            (Self::RcptTo(_), Command::Data) => Self::Reading(Reading),
            (Self::MailFrom(_), Command::Data) => Self::Invalid(Invalid {
                reason: "No valid recipients".to_string(),
            }),

            // BDAT needs the same preconditions as DATA and may repeat
            (Self::RcptTo(_) | Self::Chunking(_), Command::Bdat { .. }) => {
                Self::Chunking(Chunking)
            }
            // Mixing BDAT and DATA within one transaction is forbidden
            (Self::Chunking(_), Command::Data) => Self::Invalid(Invalid {
                reason: "DATA not allowed after BDAT".to_string(),
            }),

            // STARTTLS only before a transaction opens
            (Self::MailFrom(_) | Self::RcptTo(_) | Self::Chunking(_), Command::StartTls) => {
                Self::Invalid(Invalid {
                    reason: "STARTTLS not allowed during mail transaction".to_string(),
                })
            }

            // RSET clears the transaction, back to the ready state
            (_, Command::Rset) => {
                tx.clear();
                tx.ready_state()
            }

            (_, Command::Quit) => Self::Quit(Quit),

            (state, Command::Noop | Command::Help | Command::Vrfy(_)) => state,

            (Self::Invalid(invalid), _) => Self::Invalid(invalid),
            (state, _) => Self::Invalid(Invalid {
                reason: format!("Invalid command sequence from {state}"),
            }),
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }

    #[must_use]
    pub const fn should_close(&self) -> bool {
        matches!(self, Self::Quit(_) | Self::Close(_))
    }

    /// Between MAIL FROM and message completion.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        matches!(
            self,
            Self::MailFrom(_) | Self::RcptTo(_) | Self::Reading(_) | Self::Chunking(_)
        )
    }

    /// EHLO or HELO has been accepted.
    #[must_use]
    pub const fn greeted(&self) -> bool {
        !matches!(self, Self::Connect(_))
    }

    #[must_use]
    pub const fn extended(&self) -> bool {
        matches!(self, Self::Ehlo(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn connect_to_ehlo() {
        let mut tx = Transaction::default();
        let state = State::default().transition(
            Command::Helo(HeloVariant::Ehlo("client.example.com".to_string())),
            &mut tx,
        );
        assert!(matches!(state, State::Ehlo(_)));
        assert!(state.extended());
    }

    #[test]
    fn mail_transaction_flow() {
        let mut tx = Transaction::default();
        let state = State::Ehlo(Ehlo {
            id: "client".to_string(),
        });

        let state = state.transition(
            Command::MailFrom(Some(addr("<sender@example.com>")), MailParameters::default()),
            &mut tx,
        );
        assert!(matches!(state, State::MailFrom(_)));
        assert!(tx.from.is_some());

        let state = state.transition(Command::RcptTo(addr("<r1@example.com>")), &mut tx);
        let state = state.transition(Command::RcptTo(addr("<r2@example.com>")), &mut tx);
        assert!(matches!(state, State::RcptTo(_)));
        assert_eq!(tx.recipients.len(), 2);

        let state = state.transition(Command::Data, &mut tx);
        assert!(matches!(state, State::Reading(_)));
    }

    #[test]
    fn data_requires_recipient() {
        let mut tx = Transaction::default();
        let state = State::MailFrom(MailFrom).transition(Command::Data, &mut tx);
        assert!(state.is_error());
    }

    #[test]
    fn bdat_repeats_then_forbids_data() {
        let mut tx = Transaction::default();
        let state = State::RcptTo(RcptTo).transition(
            Command::Bdat {
                size: 100,
                last: false,
            },
            &mut tx,
        );
        assert!(matches!(state, State::Chunking(_)));

        let state = state.clone().transition(
            Command::Bdat {
                size: 50,
                last: false,
            },
            &mut tx,
        );
        assert!(matches!(state, State::Chunking(_)));

        let state = state.transition(Command::Data, &mut tx);
        assert!(state.is_error());
    }

    #[test]
    fn starttls_rejected_mid_transaction() {
        let mut tx = Transaction::default();
        let state = State::MailFrom(MailFrom).transition(Command::StartTls, &mut tx);
        assert!(state.is_error());
        if let State::Invalid(invalid) = state {
            assert!(invalid.reason.contains("not allowed during mail transaction"));
        }
    }

    #[test]
    fn rset_clears_transaction_but_keeps_greeting() {
        let mut tx = Transaction {
            helo_id: "client.example.com".to_string(),
            extended: true,
            from: Some(addr("<sender@example.com>")),
            params: MailParameters::default(),
            recipients: vec![addr("<r@example.com>")],
        };
        let state = State::RcptTo(RcptTo).transition(Command::Rset, &mut tx);
        assert!(tx.from.is_none());
        assert!(tx.recipients.is_empty());
        assert!(matches!(state, State::Ehlo(_)));
        // Ready again for a fresh MAIL FROM
        let state = state.transition(
            Command::MailFrom(Some(addr("<a@b.example>")), MailParameters::default()),
            &mut tx,
        );
        assert!(matches!(state, State::MailFrom(_)));
    }

    #[test]
    fn quit_from_any_state() {
        let mut tx = Transaction::default();
        assert!(State::default()
            .transition(Command::Quit, &mut tx)
            .should_close());
        assert!(State::RcptTo(RcptTo)
            .transition(Command::Quit, &mut tx)
            .should_close());
    }

    #[test]
    fn mail_before_greeting_is_invalid() {
        let mut tx = Transaction::default();
        let state = State::default().transition(
            Command::MailFrom(Some(addr("<a@b.example>")), MailParameters::default()),
            &mut tx,
        );
        assert!(state.is_error());
    }
}
