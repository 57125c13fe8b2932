//! Protocol-level session tests over an in-memory duplex stream.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use zetian_common::{Address, Domain, Signal};
use zetian_smtp::{AcceptAll, Extension, MailHandler, RelayDecision, Session, SessionConfig};

struct Client {
    stream: DuplexStream,
    buffer: Vec<u8>,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Read one complete reply and return its status code and text.
    async fn expect_reply(&mut self) -> (u16, String) {
        let mut text = String::new();
        loop {
            // Find a complete line in the buffer
            if let Some(pos) = self
                .buffer
                .windows(2)
                .position(|w| w == b"\r\n")
            {
                let line: Vec<u8> = self.buffer.drain(..pos + 2).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();
                assert!(line.len() >= 3, "short reply line: {line}");
                let code: u16 = line[..3].parse().expect("numeric code");
                let continuation = line.as_bytes().get(3) == Some(&b'-');
                text.push_str(line.get(4..).unwrap_or(""));
                text.push('\n');
                if !continuation {
                    return (code, text);
                }
                continue;
            }

            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream closed while waiting for reply");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn expect_code(&mut self, code: u16) -> String {
        let (got, text) = self.expect_reply().await;
        assert_eq!(got, code, "unexpected reply: {got} {text}");
        text
    }
}

fn start_session(
    config: SessionConfig,
    handler: Arc<dyn MailHandler>,
) -> (Client, tokio::task::JoinHandle<()>, tokio::sync::broadcast::Sender<Signal>) {
    let (client_side, server_side) = tokio::io::duplex(1 << 20);
    let (signal_tx, signal_rx) = tokio::sync::broadcast::channel(4);

    let session = Session::new(
        server_side,
        "203.0.113.9:45000".parse().unwrap(),
        config,
        handler,
    );

    let handle = tokio::spawn(async move {
        let _ = session.run(signal_rx).await;
    });

    (
        Client {
            stream: client_side,
            buffer: Vec::new(),
        },
        handle,
        signal_tx,
    )
}

fn default_config() -> SessionConfig {
    SessionConfig::builder()
        .with_banner("mx.test.example")
        .with_extensions(vec![
            Extension::Pipelining,
            Extension::EightBitMime,
            Extension::Size(10_000),
            Extension::Chunking,
            Extension::EnhancedStatusCodes,
        ])
        .build()
}

#[tokio::test]
async fn plain_transaction_accepted() {
    let (mut client, handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));

    client.expect_code(220).await;
    client.send("EHLO client.example").await;
    let caps = client.expect_code(250).await;
    assert!(caps.contains("PIPELINING"));
    assert!(caps.contains("SIZE 10000"));
    assert!(caps.contains("CHUNKING"));

    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;
    client.send("RCPT TO:<u@local.example>").await;
    client.expect_code(250).await;
    client.send("DATA").await;
    client.expect_code(354).await;
    client
        .send_raw(b"Subject: hi\r\n\r\nbody\r\n.\r\n")
        .await;
    let queued = client.expect_code(250).await;
    assert!(queued.contains("Queued"));

    client.send("QUIT").await;
    client.expect_code(221).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn pipelined_commands_answered_in_order() {
    let (mut client, _handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));

    client.expect_code(220).await;
    // EHLO + MAIL + RCPT in one write
    client
        .send_raw(b"EHLO c.example\r\nMAIL FROM:<a@x.example>\r\nRCPT TO:<u@y.example>\r\n")
        .await;
    client.expect_code(250).await;
    client.expect_code(250).await;
    client.expect_code(250).await;
}

#[tokio::test]
async fn command_line_length_boundary() {
    let (mut client, _handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));
    client.expect_code(220).await;

    // Exactly 512 bytes including CRLF: accepted (NOOP + padding)
    let padding = "X".repeat(512 - 2 - 5);
    let line = format!("NOOP {padding}");
    assert_eq!(line.len() + 2, 512);
    client.send(&line).await;
    client.expect_code(250).await;

    // 513 bytes: rejected with 500
    let padding = "X".repeat(513 - 2 - 5);
    let line = format!("NOOP {padding}");
    assert_eq!(line.len() + 2, 513);
    client.send(&line).await;
    client.expect_code(500).await;

    // Session is still usable
    client.send("NOOP").await;
    client.expect_code(250).await;
}

#[tokio::test]
async fn message_size_boundary() {
    let (mut client, _handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));
    client.expect_code(220).await;
    client.send("EHLO c.example").await;
    client.expect_code(250).await;

    // Declared size over the limit fails at MAIL time
    client.send("MAIL FROM:<a@x.example> SIZE=10001").await;
    client.expect_code(552).await;

    // Actual body one byte over the limit fails at DATA time
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;
    client.send("RCPT TO:<u@y.example>").await;
    client.expect_code(250).await;
    client.send("DATA").await;
    client.expect_code(354).await;

    let body = vec![b'a'; 10_001];
    client.send_raw(&body).await;
    client.send_raw(b"\r\n.\r\n").await;
    client.expect_code(552).await;

    // Exactly at the limit is accepted
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;
    client.send("RCPT TO:<u@y.example>").await;
    client.expect_code(250).await;
    client.send("DATA").await;
    client.expect_code(354).await;

    // 9998 bytes + CRLF = exactly 10000
    let body = vec![b'a'; 9998];
    client.send_raw(&body).await;
    client.send_raw(b"\r\n.\r\n").await;
    client.expect_code(250).await;
}

#[tokio::test]
async fn bdat_empty_last_seals_envelope() {
    let (mut client, _handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));
    client.expect_code(220).await;
    client.send("EHLO c.example").await;
    client.expect_code(250).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;
    client.send("RCPT TO:<u@y.example>").await;
    client.expect_code(250).await;

    client.send("BDAT 0 LAST").await;
    let reply = client.expect_code(250).await;
    assert!(reply.contains("Queued"));
}

#[tokio::test]
async fn bdat_chunks_accumulate() {
    let (mut client, _handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));
    client.expect_code(220).await;
    client.send("EHLO c.example").await;
    client.expect_code(250).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;
    client.send("RCPT TO:<u@y.example>").await;
    client.expect_code(250).await;

    client.send_raw(b"BDAT 12\r\nSubject: hi\n").await;
    client.expect_code(250).await;
    client.send_raw(b"BDAT 5 LAST\r\nhello").await;
    let reply = client.expect_code(250).await;
    assert!(reply.contains("Queued"));

    // DATA after BDAT in a fresh transaction still works
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;
}

#[tokio::test]
async fn bdat_without_rcpt_is_rejected_but_consumed() {
    let (mut client, _handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));
    client.expect_code(220).await;
    client.send("EHLO c.example").await;
    client.expect_code(250).await;

    client.send_raw(b"BDAT 5\r\nhello").await;
    client.expect_code(503).await;

    // The chunk bytes were consumed; the session is still in sync
    client.send("NOOP").await;
    client.expect_code(250).await;
}

#[tokio::test]
async fn data_requires_rcpt() {
    let (mut client, _handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));
    client.expect_code(220).await;
    client.send("EHLO c.example").await;
    client.expect_code(250).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;
    client.send("DATA").await;
    client.expect_code(503).await;
}

struct DenyExternal;

#[async_trait]
impl MailHandler for DenyExternal {
    async fn relay_allowed(
        &self,
        _recipient: &Address,
        domain: &Domain,
        _remote_ip: IpAddr,
        _authenticated: bool,
    ) -> RelayDecision {
        if domain.as_str() == "local.example" {
            RelayDecision::Local
        } else {
            RelayDecision::Denied
        }
    }
}

#[tokio::test]
async fn relay_denied_for_unauthorized_recipient() {
    let (mut client, _handle, _signal) = start_session(default_config(), Arc::new(DenyExternal));
    client.expect_code(220).await;
    client.send("EHLO c.example").await;
    client.expect_code(250).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;

    client.send("RCPT TO:<u@external.example>").await;
    let text = client.expect_code(550).await;
    assert!(text.contains("relay denied"));

    // A local recipient is still fine
    client.send("RCPT TO:<u@local.example>").await;
    client.expect_code(250).await;
}

#[tokio::test]
async fn max_recipients_cap() {
    let config = SessionConfig::builder()
        .with_banner("mx.test.example")
        .with_max_recipients(2)
        .build();
    let (mut client, _handle, _signal) = start_session(config, Arc::new(AcceptAll));

    client.expect_code(220).await;
    client.send("EHLO c.example").await;
    client.expect_code(250).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;

    client.send("RCPT TO:<u1@y.example>").await;
    client.expect_code(250).await;
    client.send("RCPT TO:<u2@y.example>").await;
    client.expect_code(250).await;
    client.send("RCPT TO:<u3@y.example>").await;
    client.expect_code(452).await;
}

#[tokio::test]
async fn consecutive_errors_close_session() {
    let (mut client, handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));
    client.expect_code(220).await;

    for _ in 0..4 {
        client.send("BOGUS").await;
        client.expect_code(500).await;
    }
    client.send("BOGUS").await;
    client.expect_code(500).await;
    client.expect_code(421).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_signal_sends_421() {
    let (mut client, handle, signal) = start_session(default_config(), Arc::new(AcceptAll));
    client.expect_code(220).await;

    signal.send(Signal::Shutdown).unwrap();
    client.expect_code(421).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn rset_clears_transaction() {
    let (mut client, _handle, _signal) = start_session(default_config(), Arc::new(AcceptAll));
    client.expect_code(220).await;
    client.send("EHLO c.example").await;
    client.expect_code(250).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;
    client.send("RSET").await;
    client.expect_code(250).await;

    // RCPT now lacks a MAIL
    client.send("RCPT TO:<u@y.example>").await;
    client.expect_code(503).await;
}
