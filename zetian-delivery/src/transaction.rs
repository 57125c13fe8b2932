//! One outbound SMTP transaction: connect (with host fall-through),
//! negotiate, and deliver to a set of recipients, producing an outcome
//! per recipient.

use std::time::Duration;

use zetian_common::Envelope;
use zetian_smtp::client::{Response, SmtpClient};

use crate::{
    config::RelayOptions,
    entry::Outcome,
    pool::ConnectionPool,
    route::HostTarget,
};

/// Per-recipient outcomes of one delivery attempt.
pub type RecipientOutcomes = Vec<(String, Outcome)>;

fn classify(response: &Response, context: &str) -> Outcome {
    if response.is_permanent() {
        Outcome::PermFail(format!("{context}: {} {}", response.code, response.message()))
    } else {
        Outcome::TempFail(format!("{context}: {} {}", response.code, response.message()))
    }
}

fn all_outcomes(recipients: &[String], outcome: &Outcome) -> RecipientOutcomes {
    recipients
        .iter()
        .map(|r| (r.clone(), outcome.clone()))
        .collect()
}

/// Deliver `envelope`/`body` to `recipients` via the first target that
/// accepts a connection. Connect and handshake failures fall through to
/// the next target; SMTP-level rejections do not.
pub async fn deliver(
    pool: &ConnectionPool,
    targets: &[HostTarget],
    envelope: &Envelope,
    body: &[u8],
    recipients: &[String],
    options: &RelayOptions,
) -> RecipientOutcomes {
    let mut last_connect_error = String::from("no targets");

    for target in targets {
        let address = target.address();
        let mut slot = pool.acquire(&address).await;

        let client = if let Some(reused) = slot.take_reused() {
            tracing::debug!(host = %address, "Reusing pooled connection");
            Ok(reused)
        } else {
            connect(target, options).await
        };

        let mut client = match client {
            Ok(client) => client,
            Err(reason) => {
                tracing::debug!(host = %address, "Connect failed: {reason}");
                last_connect_error = reason;
                continue;
            }
        };

        let outcomes = transact(&mut client, target, envelope, body, recipients, options).await;

        match outcomes {
            TransactResult::Done(outcomes) => {
                slot.park(client);
                return outcomes;
            }
            TransactResult::HandshakeFailed(reason) => {
                // The session never got going; try the next host
                last_connect_error = reason;
                let _ = client.quit().await;
            }
        }
    }

    all_outcomes(
        recipients,
        &Outcome::TempFail(format!("All routes unreachable: {last_connect_error}")),
    )
}

async fn connect(target: &HostTarget, options: &RelayOptions) -> Result<SmtpClient, String> {
    let address = target.address();
    let timeout = Duration::from_secs(options.connection_timeout_secs);

    let connected = if target.use_tls {
        tokio::time::timeout(
            timeout,
            SmtpClient::connect_tls(&address, target.host.clone(), options.accept_invalid_certs),
        )
        .await
    } else {
        tokio::time::timeout(timeout, SmtpClient::connect(&address, target.host.clone())).await
    };

    let mut client = match connected {
        Ok(Ok(client)) => client.accept_invalid_certs(options.accept_invalid_certs),
        Ok(Err(e)) => return Err(format!("connect {address}: {e}")),
        Err(_) => return Err(format!("connect {address}: timed out after {timeout:?}")),
    };

    let greeting = tokio::time::timeout(timeout, client.read_greeting())
        .await
        .map_err(|_| format!("greeting {address}: timed out"))?
        .map_err(|e| format!("greeting {address}: {e}"))?;
    if !greeting.is_success() {
        return Err(format!(
            "greeting {address}: {} {}",
            greeting.code,
            greeting.message()
        ));
    }

    Ok(client)
}

enum TransactResult {
    Done(RecipientOutcomes),
    /// EHLO/STARTTLS/AUTH failed before MAIL; the next host may fare
    /// better.
    HandshakeFailed(String),
}

async fn transact(
    client: &mut SmtpClient,
    target: &HostTarget,
    envelope: &Envelope,
    body: &[u8],
    recipients: &[String],
    options: &RelayOptions,
) -> TransactResult {
    let timeout = Duration::from_secs(options.connection_timeout_secs);

    macro_rules! step {
        ($future:expr, $context:expr) => {
            match tokio::time::timeout(timeout, $future).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    return TransactResult::HandshakeFailed(format!("{}: {e}", $context));
                }
                Err(_) => {
                    return TransactResult::HandshakeFailed(format!("{}: timed out", $context));
                }
            }
        };
    }

    // EHLO, STARTTLS when called for, then EHLO again (RFC 3207)
    let ehlo = step!(client.ehlo(&options.helo_name), "EHLO");
    if !ehlo.is_success() {
        return TransactResult::HandshakeFailed(format!("EHLO: {} {}", ehlo.code, ehlo.message()));
    }

    let wants_tls = options.require_tls || (options.enable_tls && ehlo.has_capability("STARTTLS"));
    if wants_tls && !client.is_tls() {
        let response = step!(client.starttls(), "STARTTLS");
        if response.is_success() {
            let ehlo = step!(client.ehlo(&options.helo_name), "EHLO after STARTTLS");
            if !ehlo.is_success() {
                return TransactResult::HandshakeFailed(format!(
                    "EHLO after STARTTLS: {} {}",
                    ehlo.code,
                    ehlo.message()
                ));
            }
        } else if options.require_tls {
            return TransactResult::Done(all_outcomes(
                recipients,
                &Outcome::PermFail(format!(
                    "TLS required but refused: {} {}",
                    response.code,
                    response.message()
                )),
            ));
        }
    }

    // Stored credentials for this hop
    if let (Some(username), Some(password)) = (&target.username, &target.password) {
        let response = step!(client.auth_plain(username, password), "AUTH");
        if !response.is_success() {
            if response.is_permanent() {
                return TransactResult::Done(all_outcomes(
                    recipients,
                    &Outcome::PermFail(format!(
                        "Authentication failed: {} {}",
                        response.code,
                        response.message()
                    )),
                ));
            }
            return TransactResult::HandshakeFailed(format!(
                "AUTH: {} {}",
                response.code,
                response.message()
            ));
        }
    }

    let sender = envelope
        .from()
        .map(zetian_common::Address::as_smtp_string)
        .unwrap_or_default();

    let mail = step!(client.mail_from(&sender, Some(body.len())), "MAIL FROM");
    if !mail.is_success() {
        return TransactResult::Done(all_outcomes(recipients, &classify(&mail, "MAIL FROM")));
    }

    // Servers may reject individual recipients; track acceptance per
    // recipient
    let mut outcomes: RecipientOutcomes = Vec::with_capacity(recipients.len());
    let mut accepted: Vec<String> = Vec::with_capacity(recipients.len());

    for recipient in recipients {
        let response = step!(client.rcpt_to(recipient), "RCPT TO");
        if response.is_success() {
            accepted.push(recipient.clone());
        } else {
            outcomes.push((recipient.clone(), classify(&response, "RCPT TO")));
        }
    }

    if accepted.is_empty() {
        let _ = client.rset().await;
        return TransactResult::Done(outcomes);
    }

    let data = step!(client.data(), "DATA");
    if !(300..400).contains(&data.code) {
        let outcome = classify(&data, "DATA");
        outcomes.extend(all_outcomes(&accepted, &outcome));
        return TransactResult::Done(outcomes);
    }

    let data_timeout = Duration::from_secs(options.connection_timeout_secs.max(120));
    let result = match tokio::time::timeout(data_timeout, client.send_data(body)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            outcomes.extend(all_outcomes(
                &accepted,
                &Outcome::TempFail(format!("DATA transmission: {e}")),
            ));
            return TransactResult::Done(outcomes);
        }
        Err(_) => {
            outcomes.extend(all_outcomes(
                &accepted,
                &Outcome::TempFail("DATA transmission timed out".to_string()),
            ));
            return TransactResult::Done(outcomes);
        }
    };

    let final_outcome = if result.is_success() {
        Outcome::Delivered
    } else {
        classify(&result, "message")
    };
    outcomes.extend(all_outcomes(&accepted, &final_outcome));

    TransactResult::Done(outcomes)
}
