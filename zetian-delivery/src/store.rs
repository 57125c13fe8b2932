//! Queue persistence behind the `RelayStore` trait.
//!
//! Correctness depends only on an atomic `acquire_due` (no two callers
//! get the same entry while it is `InProgress`) and idempotent updates;
//! the storage medium is interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    entry::{QueueEntry, QueueId, QueueStatus},
    error::{DeliveryError, SystemError},
};

pub type Result<T> = std::result::Result<T, DeliveryError>;

#[async_trait]
pub trait RelayStore: Send + Sync + std::fmt::Debug {
    async fn insert(&self, entry: &QueueEntry) -> Result<()>;

    async fn update(&self, entry: &QueueEntry) -> Result<()>;

    async fn get(&self, id: QueueId) -> Result<Option<QueueEntry>>;

    async fn remove(&self, id: QueueId) -> Result<Option<QueueEntry>>;

    async fn list(&self) -> Result<Vec<QueueEntry>>;

    /// Atomically select up to `max_n` due entries from `queue_name`,
    /// ordered `(priority desc, queued_at asc)`, and mark them
    /// `InProgress` for the caller. The per-entry mark is a
    /// compare-and-set: concurrent callers never receive the same entry.
    async fn acquire_due(
        &self,
        now: DateTime<Utc>,
        max_n: usize,
        queue_name: &str,
    ) -> Result<Vec<QueueEntry>>;
}

/// In-memory store over a concurrent map.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelayStore {
    entries: Arc<DashMap<QueueId, QueueEntry>>,
}

impl MemoryRelayStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelayStore for MemoryRelayStore {
    async fn insert(&self, entry: &QueueEntry) -> Result<()> {
        self.entries.insert(entry.queue_id, entry.clone());
        Ok(())
    }

    async fn update(&self, entry: &QueueEntry) -> Result<()> {
        if !self.entries.contains_key(&entry.queue_id) {
            return Err(SystemError::EntryNotFound(entry.queue_id.to_string()).into());
        }
        self.entries.insert(entry.queue_id, entry.clone());
        Ok(())
    }

    async fn get(&self, id: QueueId) -> Result<Option<QueueEntry>> {
        Ok(self.entries.get(&id).map(|e| e.clone()))
    }

    async fn remove(&self, id: QueueId) -> Result<Option<QueueEntry>> {
        Ok(self.entries.remove(&id).map(|(_, e)| e))
    }

    async fn list(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.entries.iter().map(|e| e.clone()).collect())
    }

    async fn acquire_due(
        &self,
        now: DateTime<Utc>,
        max_n: usize,
        queue_name: &str,
    ) -> Result<Vec<QueueEntry>> {
        // Candidate pass without locks held across entries
        let mut candidates: Vec<(QueueId, crate::entry::Priority, DateTime<Utc>)> = self
            .entries
            .iter()
            .filter(|e| e.queue_name == queue_name && e.is_due(now))
            .map(|e| (e.queue_id, e.priority, e.queued_at))
            .collect();

        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)));

        let mut acquired = Vec::new();
        for (id, _, _) in candidates {
            if acquired.len() >= max_n {
                break;
            }
            // CAS under the entry's own lock: a concurrent caller that
            // marked it first leaves it ineligible here
            if let Some(mut entry) = self.entries.get_mut(&id) {
                if entry.is_due(now) {
                    entry.status = QueueStatus::InProgress;
                    acquired.push(entry.clone());
                }
            }
        }

        Ok(acquired)
    }
}
