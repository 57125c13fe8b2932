//! In-process server harness for end-to-end tests.

#![allow(dead_code)] // Shared across test binaries; not all use everything

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use zetian::{EventBus, ZetianConfig, ZetianHandler};
use zetian_common::Signal;
use zetian_delivery::{MemoryRelayStore, RelayQueue, RelayStore};
use zetian_filter::Pipeline;
use zetian_smtp::{Extension, Listener, ListenerConfig, SessionConfig};
use zetian_store::{MemoryMessageStore, MessageStore};

pub fn free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemoryMessageStore>,
    pub queue: RelayQueue,
    pub shutdown: tokio::sync::broadcast::Sender<Signal>,
}

impl TestServer {
    /// Start a listener wired to the full handler stack, with in-memory
    /// stores the test can inspect.
    pub async fn start(mut config: ZetianConfig, pipeline: Pipeline) -> Self {
        let addr = free_port();
        config.server.port = addr.port();
        config.server.bind_address = addr.ip();

        let store = Arc::new(MemoryMessageStore::new());
        let relay_store: Arc<dyn RelayStore> = Arc::new(MemoryRelayStore::new());
        let queue = RelayQueue::new(relay_store, config.retry);

        let handler = Arc::new(ZetianHandler::new(
            config.clone(),
            pipeline,
            Arc::clone(&store) as Arc<dyn MessageStore>,
            queue.clone(),
            None,
            EventBus::new(),
        ));

        let session_config = SessionConfig::builder()
            .with_extensions(vec![
                Extension::Pipelining,
                Extension::EightBitMime,
                Extension::Size(config.server.max_message_size),
                Extension::Chunking,
                Extension::EnhancedStatusCodes,
            ])
            .with_banner(config.server.server_name.clone())
            .with_max_recipients(config.server.max_recipients)
            .build();

        let listener = Listener::new(
            ListenerConfig {
                bind: addr,
                max_connections: config.server.max_connections,
                max_connections_per_ip: config.server.max_connections_per_ip,
            },
            session_config,
            handler,
        );

        let (shutdown, _) = tokio::sync::broadcast::channel(4);
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _ = listener.serve(shutdown).await;
            });
        }

        // Wait until the listener accepts
        for _ in 0..100 {
            if TcpStream::connect(addr).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Self {
            addr,
            store,
            queue,
            shutdown,
        }
    }

    pub async fn client(&self) -> TestClient {
        let mut client = TestClient::connect(self.addr).await;
        client.expect_code(220).await;
        client
    }
}

/// Scripted SMTP client for driving the server.
pub struct TestClient {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Read one complete (possibly multi-line) reply.
    pub async fn expect_reply(&mut self) -> (u16, String) {
        let mut text = String::new();
        loop {
            if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
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

    pub async fn expect_code(&mut self, code: u16) -> String {
        let (got, text) = self.expect_reply().await;
        assert_eq!(got, code, "unexpected reply: {got} {text}");
        text
    }
}
