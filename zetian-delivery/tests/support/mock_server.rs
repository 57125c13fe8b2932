//! Minimal scriptable SMTP server for delivery tests.

#![allow(dead_code)] // Test utility module; not every test uses everything

use std::{
    net::SocketAddr,
    sync::Arc,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
};

/// Response the mock returns for a given command class.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub code: u16,
    pub message: String,
}

impl MockResponse {
    fn new(code: u16, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    fn line(&self) -> String {
        format!("{} {}\r\n", self.code, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub greeting: MockResponse,
    pub ehlo_capabilities: Vec<String>,
    pub mail_from: MockResponse,
    /// Consumed one per RCPT; the last repeats.
    pub rcpt_to: Vec<MockResponse>,
    pub data: MockResponse,
    pub data_end: MockResponse,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            greeting: MockResponse::new(220, "mock ready"),
            ehlo_capabilities: vec!["mock.example".to_string(), "SIZE 1000000".to_string()],
            mail_from: MockResponse::new(250, "OK"),
            rcpt_to: vec![MockResponse::new(250, "OK")],
            data: MockResponse::new(354, "go ahead"),
            data_end: MockResponse::new(250, "accepted"),
        }
    }
}

/// Commands and payloads seen by the mock, for assertions.
#[derive(Debug, Default)]
pub struct Observed {
    pub commands: Vec<String>,
    pub messages: Vec<Vec<u8>>,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    observed: Arc<RwLock<Observed>>,
}

impl MockSmtpServer {
    pub async fn start(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let observed = Arc::new(RwLock::new(Observed::default()));

        let accept_observed = Arc::clone(&observed);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let config = config.clone();
                let observed = Arc::clone(&accept_observed);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, config, observed).await;
                });
            }
        });

        Self { addr, observed }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn commands(&self) -> Vec<String> {
        self.observed.read().await.commands.clone()
    }

    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.observed.read().await.messages.clone()
    }
}

async fn serve_connection(
    stream: TcpStream,
    config: MockConfig,
    observed: Arc<RwLock<Observed>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(config.greeting.line().as_bytes())
        .await?;

    let mut rcpt_index = 0usize;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        observed.write().await.commands.push(command.clone());

        let upper = command.to_ascii_uppercase();

        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            let caps = &config.ehlo_capabilities;
            let mut response = String::new();
            for (index, cap) in caps.iter().enumerate() {
                let sep = if index + 1 == caps.len() { ' ' } else { '-' };
                response.push_str(&format!("250{sep}{cap}\r\n"));
            }
            write_half.write_all(response.as_bytes()).await?;
        } else if upper.starts_with("MAIL") {
            write_half
                .write_all(config.mail_from.line().as_bytes())
                .await?;
        } else if upper.starts_with("RCPT") {
            let response = config
                .rcpt_to
                .get(rcpt_index)
                .or_else(|| config.rcpt_to.last())
                .cloned()
                .unwrap_or(MockResponse::new(250, "OK"));
            rcpt_index += 1;
            write_half.write_all(response.line().as_bytes()).await?;
        } else if upper == "DATA" {
            write_half.write_all(config.data.line().as_bytes()).await?;

            // Read the message content up to the terminating dot
            let mut message = Vec::new();
            loop {
                let mut body_line = String::new();
                if reader.read_line(&mut body_line).await? == 0 {
                    return Ok(());
                }
                if body_line == ".\r\n" || body_line == ".\n" {
                    break;
                }
                message.extend_from_slice(body_line.as_bytes());
            }
            observed.write().await.messages.push(message);

            write_half
                .write_all(config.data_end.line().as_bytes())
                .await?;
        } else if upper == "QUIT" {
            write_half.write_all(b"221 bye\r\n").await?;
            return Ok(());
        } else if upper == "RSET" || upper == "NOOP" {
            write_half.write_all(b"250 OK\r\n").await?;
        } else {
            write_half.write_all(b"500 what\r\n").await?;
        }
    }
}
