//! SASL authentication flows (RFC 4954).
//!
//! PLAIN arrives either as a single `AUTH PLAIN <b64>` or via an empty
//! 334 challenge; LOGIN prompts for the username and password in two
//! base64 challenges. A client reply of `*` cancels the exchange.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::extensions::Mechanism;

/// Outcome of feeding one client line into an authentication exchange.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthStep {
    /// Send `334 {challenge}` and wait for the next line.
    Challenge(String),
    /// Credentials collected; the handler decides if they are valid.
    Done { identity: String, secret: String },
    /// Client cancelled with `*`; reply 501.
    Cancelled,
    /// Unparseable exchange; reply 501.
    Malformed,
}

#[derive(Debug)]
enum FlowState {
    PlainAwaitingBlob,
    LoginAwaitingUsername,
    LoginAwaitingPassword { identity: String },
}

/// An in-progress SASL exchange, held by the session between lines.
#[derive(Debug)]
pub struct AuthFlow {
    state: FlowState,
}

impl AuthFlow {
    /// Begin an exchange. Returns the flow (if more lines are needed)
    /// and the first step.
    #[must_use]
    pub fn start(mechanism: Mechanism, initial: Option<&str>) -> (Option<Self>, AuthStep) {
        match mechanism {
            Mechanism::Plain => initial.map_or_else(
                || {
                    (
                        Some(Self {
                            state: FlowState::PlainAwaitingBlob,
                        }),
                        // RFC 4954: an empty server challenge
                        AuthStep::Challenge(String::new()),
                    )
                },
                |blob| (None, decode_plain(blob)),
            ),
            Mechanism::Login => {
                let mut flow = Self {
                    state: FlowState::LoginAwaitingUsername,
                };
                let step = initial.map_or_else(
                    || AuthStep::Challenge(BASE64.encode("Username:")),
                    |blob| flow.advance(blob),
                );
                match step {
                    AuthStep::Challenge(_) => (Some(flow), step),
                    AuthStep::Done { .. } | AuthStep::Cancelled | AuthStep::Malformed => {
                        (None, step)
                    }
                }
            }
        }
    }

    /// Feed the next client line.
    #[must_use]
    pub fn advance(&mut self, line: &str) -> AuthStep {
        let line = line.trim();
        if line == "*" {
            return AuthStep::Cancelled;
        }

        match &self.state {
            FlowState::PlainAwaitingBlob => decode_plain(line),
            FlowState::LoginAwaitingUsername => match decode_utf8(line) {
                Some(identity) => {
                    self.state = FlowState::LoginAwaitingPassword { identity };
                    AuthStep::Challenge(BASE64.encode("Password:"))
                }
                None => AuthStep::Malformed,
            },
            FlowState::LoginAwaitingPassword { identity } => match decode_utf8(line) {
                Some(secret) => AuthStep::Done {
                    identity: identity.clone(),
                    secret,
                },
                None => AuthStep::Malformed,
            },
        }
    }

}

fn decode_utf8(blob: &str) -> Option<String> {
    let bytes = BASE64.decode(blob).ok()?;
    String::from_utf8(bytes).ok()
}

/// `authzid NUL authcid NUL passwd`; the authzid is ignored, the authcid
/// becomes the session identity.
fn decode_plain(blob: &str) -> AuthStep {
    let Ok(bytes) = BASE64.decode(blob.trim()) else {
        return AuthStep::Malformed;
    };
    let parts: Vec<&[u8]> = bytes.split(|&b| b == 0).collect();
    if parts.len() != 3 {
        return AuthStep::Malformed;
    }
    match (
        std::str::from_utf8(parts[1]),
        std::str::from_utf8(parts[2]),
    ) {
        (Ok(identity), Ok(secret)) if !identity.is_empty() => AuthStep::Done {
            identity: identity.to_string(),
            secret: secret.to_string(),
        },
        _ => AuthStep::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        BASE64.encode(s)
    }

    #[test]
    fn plain_with_initial_response() {
        let blob = BASE64.encode("\0alice\0secret");
        let (flow, step) = AuthFlow::start(Mechanism::Plain, Some(&blob));
        assert!(flow.is_none());
        assert_eq!(
            step,
            AuthStep::Done {
                identity: "alice".to_string(),
                secret: "secret".to_string()
            }
        );
    }

    #[test]
    fn plain_with_challenge() {
        let (flow, step) = AuthFlow::start(Mechanism::Plain, None);
        assert_eq!(step, AuthStep::Challenge(String::new()));

        let mut flow = flow.unwrap();
        let blob = BASE64.encode("\0bob\0hunter2");
        assert_eq!(
            flow.advance(&blob),
            AuthStep::Done {
                identity: "bob".to_string(),
                secret: "hunter2".to_string()
            }
        );
    }

    #[test]
    fn login_two_step() {
        let (flow, step) = AuthFlow::start(Mechanism::Login, None);
        assert_eq!(step, AuthStep::Challenge(b64("Username:")));

        let mut flow = flow.unwrap();
        assert_eq!(flow.advance(&b64("carol")), AuthStep::Challenge(b64("Password:")));
        assert_eq!(
            flow.advance(&b64("pw")),
            AuthStep::Done {
                identity: "carol".to_string(),
                secret: "pw".to_string()
            }
        );
    }

    #[test]
    fn cancel_with_asterisk() {
        let (flow, _) = AuthFlow::start(Mechanism::Login, None);
        let mut flow = flow.unwrap();
        assert_eq!(flow.advance("*"), AuthStep::Cancelled);
    }

    #[test]
    fn malformed_blobs() {
        let (_, step) = AuthFlow::start(Mechanism::Plain, Some("not-base64!!"));
        assert_eq!(step, AuthStep::Malformed);

        // Too few NUL-separated parts
        let (_, step) = AuthFlow::start(Mechanism::Plain, Some(&BASE64.encode("no-nuls")));
        assert_eq!(step, AuthStep::Malformed);

        // Empty authcid
        let (_, step) = AuthFlow::start(Mechanism::Plain, Some(&BASE64.encode("\0\0pw")));
        assert_eq!(step, AuthStep::Malformed);
    }
}
