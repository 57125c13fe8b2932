//! Bounce message generation, RFC 3464 style.
//!
//! When an entry fails or expires and the original envelope has a real
//! sender, a multipart/report message goes back to that sender: a
//! human-readable part, a machine-readable delivery-status part, and the
//! original headers. Bounces carry the null sender and a suppression
//! flag, so a bounce never bounces.

use std::fmt::Write as _;

use zetian_common::{Address, Envelope, HeaderMap};

use crate::entry::QueueEntry;

/// Settings for DSN synthesis.
#[derive(Debug, Clone)]
pub struct BounceConfig {
    /// FQDN reported in the Reporting-MTA field.
    pub reporting_mta: String,
    /// Mailbox shown as the bounce originator.
    pub postmaster: String,
    /// Attach the machine-readable delivery-status part.
    pub include_dsn: bool,
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            reporting_mta: "localhost".to_string(),
            postmaster: "postmaster@localhost".to_string(),
            include_dsn: true,
        }
    }
}

/// A synthesized bounce: the envelope plus the message bytes to store.
#[derive(Debug)]
pub struct Bounce {
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

/// Build a bounce for a failed or expired entry.
///
/// Returns `None` when the entry must not bounce: null sender, bounce
/// suppression, or no failed recipients to report.
#[must_use]
pub fn generate(entry: &QueueEntry, config: &BounceConfig) -> Option<Bounce> {
    if entry.suppress_bounce {
        return None;
    }
    let original_sender = entry.envelope.from()?;

    let failed = entry.failed_recipients();
    if failed.is_empty() {
        return None;
    }

    let boundary = format!("----=_Bounce_{}", ulid::Ulid::new());
    let subject = "Delivery Status Notification (Failure)";

    let human = human_readable_part(original_sender, &failed, entry);
    let status = machine_readable_part(config, &failed, entry);
    let original_headers = entry.envelope.headers().to_wire();

    let mut body = String::new();
    let _ = write!(
        body,
        "Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
         MIME-Version: 1.0\r\n\
         From: Mail Delivery System <{postmaster}>\r\n\
         To: {sender}\r\n\
         Subject: {subject}\r\n\
         Auto-Submitted: auto-replied\r\n\
         \r\n\
         This is a multi-part message in MIME format.\r\n\
         \r\n\
         --{boundary}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {human}\r\n",
        postmaster = config.postmaster,
        sender = original_sender,
    );

    if config.include_dsn {
        let _ = write!(
            body,
            "--{boundary}\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             {status}\r\n",
        );
    }

    let _ = write!(
        body,
        "--{boundary}\r\n\
         Content-Type: text/rfc822-headers\r\n\
         \r\n\
         {original_headers}\r\n\
         --{boundary}--\r\n",
    );

    let bytes = body.into_bytes();
    let envelope = Envelope::builder()
        // Null reverse path, terminal on failure
        .from(None)
        .recipients(vec![original_sender.clone()])
        .size_bytes(bytes.len())
        .ehlo_name(config.reporting_mta.clone())
        .headers(HeaderMap::parse(&bytes))
        .seal();

    Some(Bounce {
        envelope,
        body: bytes,
    })
}

fn human_readable_part(
    original_sender: &Address,
    failed: &[(String, String)],
    entry: &QueueEntry,
) -> String {
    let mut out = format!(
        "This is the mail system at {sender_host}.\n\
         \n\
         Your message could not be delivered to one or more recipients.\n\
         \n\
         Failed recipients:\n",
        sender_host = entry.envelope.ehlo_name(),
    );

    for (recipient, error) in failed {
        let _ = writeln!(out, "  <{recipient}>: {error}");
    }

    let _ = write!(
        out,
        "\nMessage details:\n\
         - Original sender: {original_sender}\n\
         - Delivery attempts: {attempts}\n\
         - Queued: {queued_at}\n",
        attempts = entry.attempts,
        queued_at = entry.queued_at.to_rfc2822(),
    );

    out
}

fn machine_readable_part(
    config: &BounceConfig,
    failed: &[(String, String)],
    entry: &QueueEntry,
) -> String {
    let mut dsn = format!("Reporting-MTA: dns; {}\r\n", config.reporting_mta);
    let _ = write!(dsn, "Arrival-Date: {}\r\n", entry.queued_at.to_rfc2822());

    for (recipient, error) in failed {
        dsn.push_str("\r\n");
        let _ = write!(dsn, "Final-Recipient: rfc822; {recipient}\r\n");
        dsn.push_str("Action: failed\r\n");
        dsn.push_str("Status: 5.0.0\r\n");
        let _ = write!(dsn, "Diagnostic-Code: smtp; {error}\r\n");
        if let Some(last) = entry.last_attempt_at {
            let _ = write!(dsn, "Last-Attempt-Date: {}\r\n", last.to_rfc2822());
        }
    }

    dsn
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::entry::{Priority, RecipientState};

    use super::*;

    fn failed_entry() -> QueueEntry {
        let envelope = Envelope::builder()
            .from(Some(Address::parse("<sender@x.example>").unwrap()))
            .recipients(vec![Address::parse("<gone@y.example>").unwrap()])
            .headers(HeaderMap::parse(b"Subject: original\r\n\r\n"))
            .ehlo_name("client.example")
            .seal();
        let mut entry = QueueEntry::new(
            envelope,
            Priority::Normal,
            None,
            Duration::from_secs(60),
            "outbound",
        );
        let delivery = entry.per_recipient.get_mut("gone@y.example").unwrap();
        delivery.state = RecipientState::Failed;
        delivery.last_error = Some("550 no such user".to_string());
        entry.status = crate::entry::QueueStatus::Failed;
        entry
    }

    #[test]
    fn bounce_has_null_sender_and_targets_originator() {
        let bounce = generate(&failed_entry(), &BounceConfig::default()).unwrap();

        assert!(bounce.envelope.is_null_sender());
        assert_eq!(bounce.envelope.recipients().len(), 1);
        assert_eq!(
            bounce.envelope.recipients()[0].as_smtp_string(),
            "sender@x.example"
        );
    }

    #[test]
    fn bounce_body_enumerates_failures() {
        let bounce = generate(&failed_entry(), &BounceConfig::default()).unwrap();
        let body = String::from_utf8(bounce.body).unwrap();

        assert!(body.contains("multipart/report"));
        assert!(body.contains("delivery-status"));
        assert!(body.contains("<gone@y.example>: 550 no such user"));
        assert!(body.contains("Final-Recipient: rfc822; gone@y.example"));
        assert!(body.contains("Action: failed"));
        assert!(body.contains("Subject: original"));
    }

    #[test]
    fn suppressed_entries_do_not_bounce() {
        let mut entry = failed_entry();
        entry.suppress_bounce = true;
        assert!(generate(&entry, &BounceConfig::default()).is_none());
    }

    #[test]
    fn null_sender_never_bounces() {
        let envelope = Envelope::builder()
            .recipients(vec![Address::parse("<gone@y.example>").unwrap()])
            .seal();
        let mut entry = QueueEntry::new(
            envelope,
            Priority::Normal,
            None,
            Duration::from_secs(60),
            "outbound",
        );
        entry.per_recipient.get_mut("gone@y.example").unwrap().state = RecipientState::Failed;
        assert!(generate(&entry, &BounceConfig::default()).is_none());
    }

    #[test]
    fn dsn_part_is_optional() {
        let config = BounceConfig {
            include_dsn: false,
            ..BounceConfig::default()
        };
        let bounce = generate(&failed_entry(), &config).unwrap();
        let body = String::from_utf8(bounce.body).unwrap();
        assert!(!body.contains("message/delivery-status"));
        // Human part still present
        assert!(body.contains("could not be delivered"));
    }
}
