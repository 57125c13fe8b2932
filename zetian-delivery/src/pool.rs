//! Per-host outbound connection accounting.
//!
//! Each destination host gets a counting semaphore capping concurrent
//! connections, plus a small idle list so consecutive deliveries to the
//! same host can reuse a session until its message cap is reached.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use zetian_smtp::client::SmtpClient;

#[derive(Debug)]
struct HostPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<SmtpClient>>,
}

/// Pool of per-host connection slots.
pub struct ConnectionPool {
    hosts: DashMap<String, Arc<HostPool>>,
    max_connections_per_host: usize,
    max_messages_per_connection: usize,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("hosts", &self.hosts.len())
            .field("max_connections_per_host", &self.max_connections_per_host)
            .finish_non_exhaustive()
    }
}

/// A held slot: the permit keeps the per-host cap honest, and the
/// optional client is a reusable idle session.
pub struct PooledSlot {
    reused: Option<SmtpClient>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<HostPool>,
    max_messages: usize,
}

impl PooledSlot {
    /// Take the reusable idle session, if one was pooled.
    pub fn take_reused(&mut self) -> Option<SmtpClient> {
        self.reused.take()
    }

    /// Return a still-healthy session for reuse; sessions at their
    /// message cap are dropped instead.
    pub fn park(self, client: SmtpClient) {
        if client.messages_sent() < self.max_messages {
            self.pool.idle.lock().push(client);
        }
    }
}

impl ConnectionPool {
    #[must_use]
    pub fn new(max_connections_per_host: usize, max_messages_per_connection: usize) -> Self {
        Self {
            hosts: DashMap::new(),
            max_connections_per_host: max_connections_per_host.max(1),
            max_messages_per_connection: max_messages_per_connection.max(1),
        }
    }

    fn host_pool(&self, address: &str) -> Arc<HostPool> {
        self.hosts
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(HostPool {
                    semaphore: Arc::new(Semaphore::new(self.max_connections_per_host)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Wait for a connection slot to `address`.
    pub async fn acquire(&self, address: &str) -> PooledSlot {
        let pool = self.host_pool(address);
        let permit = Arc::clone(&pool.semaphore)
            .acquire_owned()
            .await
            .expect("pool semaphore never closes");
        let reused = pool.idle.lock().pop();

        PooledSlot {
            reused,
            _permit: permit,
            pool,
            max_messages: self.max_messages_per_connection,
        }
    }

    /// Slots currently available for `address`.
    #[must_use]
    pub fn available(&self, address: &str) -> usize {
        self.hosts
            .get(address)
            .map_or(self.max_connections_per_host, |pool| {
                pool.semaphore.available_permits()
            })
    }
}
