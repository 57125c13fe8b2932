//! TCP accept loop and connection governor.
//!
//! Applies the global and per-IP connection caps before a session task
//! is spawned; over-cap connections get a one-line 421 and are closed.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use tokio::net::TcpListener;
use zetian_common::{internal, Signal};

use crate::{handler::MailHandler, session::Session, SessionConfig};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    /// Total concurrent connections (0 = unlimited).
    pub max_connections: usize,
    /// Concurrent connections per client IP (0 = unlimited).
    pub max_connections_per_ip: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25".parse().expect("static socket address"),
            max_connections: 0,
            max_connections_per_ip: 0,
        }
    }
}

/// Tracks live connection counts across session tasks.
#[derive(Debug, Default)]
struct Governor {
    total: AtomicUsize,
    per_ip: DashMap<IpAddr, usize>,
}

impl Governor {
    /// Try to admit a connection from `ip`.
    fn admit(&self, ip: IpAddr, config: &ListenerConfig) -> bool {
        if config.max_connections > 0 && self.total.load(Ordering::SeqCst) >= config.max_connections
        {
            return false;
        }

        if config.max_connections_per_ip > 0 {
            let mut entry = self.per_ip.entry(ip).or_insert(0);
            if *entry >= config.max_connections_per_ip {
                return false;
            }
            *entry += 1;
        }

        self.total.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn depart(&self, ip: IpAddr) {
        self.total.fetch_sub(1, Ordering::SeqCst);
        let emptied = if let Some(mut entry) = self.per_ip.get_mut(&ip) {
            *entry = entry.saturating_sub(1);
            *entry == 0
        } else {
            false
        };
        if emptied {
            self.per_ip.remove_if(&ip, |_, count| *count == 0);
        }
    }
}

pub struct Listener {
    config: ListenerConfig,
    session_config: SessionConfig,
    handler: Arc<dyn MailHandler>,
    governor: Arc<Governor>,
}

impl Listener {
    #[must_use]
    pub fn new(
        config: ListenerConfig,
        session_config: SessionConfig,
        handler: Arc<dyn MailHandler>,
    ) -> Self {
        Self {
            config,
            session_config,
            handler,
            governor: Arc::new(Governor::default()),
        }
    }

    /// Accept connections until shutdown, then wait for live sessions.
    pub async fn serve(
        &self,
        shutdown: tokio::sync::broadcast::Sender<Signal>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind).await?;
        let local = listener.local_addr()?;
        internal!(level = INFO, "SMTP listener on {}", local);

        let mut receiver = shutdown.subscribe();
        let mut sessions = Vec::new();

        loop {
            tokio::select! {
                sig = receiver.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        internal!(
                            level = INFO,
                            "SMTP listener {} shutting down, finishing sessions ...",
                            local
                        );
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    tracing::debug!("Connection received from {peer}");

                    if !self.governor.admit(peer.ip(), &self.config) {
                        tracing::warn!(peer = ?peer, "Connection cap exceeded, refusing");
                        tokio::spawn(async move {
                            use tokio::io::AsyncWriteExt;
                            let mut stream = stream;
                            let _ = stream
                                .write_all(b"421 Too many connections, try again later\r\n")
                                .await;
                        });
                        continue;
                    }

                    let session = Session::new(
                        stream,
                        peer,
                        self.session_config.clone(),
                        Arc::clone(&self.handler),
                    );
                    let governor = Arc::clone(&self.governor);
                    let signal = shutdown.subscribe();

                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            internal!(level = ERROR, "Session error: {err}");
                        }
                        governor.depart(peer.ip());
                    }));

                    // Keep the join list from growing without bound
                    sessions.retain(|handle| !handle.is_finished());
                }
            }
        }

        for session in sessions {
            let _ = session.await;
        }

        Ok(())
    }

    /// The address this listener was configured for.
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        self.config.bind
    }
}
