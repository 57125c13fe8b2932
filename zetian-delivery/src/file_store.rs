//! File-backed relay store.
//!
//! Entries persist as bincode files named `<queue-id>.entry`; an
//! in-memory index carries the same data for scanning and for the
//! `acquire_due` compare-and-set. On open, stale `InProgress` entries
//! (a previous process died mid-dispatch) are demoted back to `Queued`
//! so they are retried rather than orphaned.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    entry::{QueueEntry, QueueId, QueueStatus},
    error::{DeliveryError, SystemError},
    store::{RelayStore, Result},
};

#[derive(Debug, Clone)]
pub struct FileRelayStore {
    directory: PathBuf,
    index: Arc<DashMap<QueueId, QueueEntry>>,
}

impl FileRelayStore {
    /// Open the store, loading every persisted entry into the index.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(SystemError::Io)?;

        let store = Self {
            directory,
            index: Arc::new(DashMap::new()),
        };

        let mut restored = 0usize;
        let mut dir = tokio::fs::read_dir(&store.directory)
            .await
            .map_err(SystemError::Io)?;
        while let Some(file) = dir.next_entry().await.map_err(SystemError::Io)? {
            let name = file.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".entry") else {
                continue;
            };
            if QueueId::parse(stem).is_none() {
                continue;
            }

            let bytes = tokio::fs::read(file.path()).await.map_err(SystemError::Io)?;
            let (mut entry, _): (QueueEntry, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| SystemError::Serialization(e.to_string()))?;

            // A dispatch owned by a dead process is picked up again
            if entry.status == QueueStatus::InProgress {
                entry.status = QueueStatus::Queued;
                store.persist(&entry).await?;
            }

            store.index.insert(entry.queue_id, entry);
            restored += 1;
        }

        if restored > 0 {
            tracing::info!(count = restored, "Restored queue entries from disk");
        }

        Ok(store)
    }

    fn path_for(&self, id: QueueId) -> PathBuf {
        self.directory.join(format!("{id}.entry"))
    }

    async fn persist(&self, entry: &QueueEntry) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| DeliveryError::System(SystemError::Serialization(e.to_string())))?;
        let path = self.path_for(entry.queue_id);
        let tmp = path.with_extension("entry.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(SystemError::Io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(SystemError::Io)?;
        Ok(())
    }
}

#[async_trait]
impl RelayStore for FileRelayStore {
    async fn insert(&self, entry: &QueueEntry) -> Result<()> {
        self.persist(entry).await?;
        self.index.insert(entry.queue_id, entry.clone());
        Ok(())
    }

    async fn update(&self, entry: &QueueEntry) -> Result<()> {
        if !self.index.contains_key(&entry.queue_id) {
            return Err(SystemError::EntryNotFound(entry.queue_id.to_string()).into());
        }
        self.persist(entry).await?;
        self.index.insert(entry.queue_id, entry.clone());
        Ok(())
    }

    async fn get(&self, id: QueueId) -> Result<Option<QueueEntry>> {
        Ok(self.index.get(&id).map(|e| e.clone()))
    }

    async fn remove(&self, id: QueueId) -> Result<Option<QueueEntry>> {
        let removed = self.index.remove(&id).map(|(_, e)| e);
        if removed.is_some() {
            match tokio::fs::remove_file(self.path_for(id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DeliveryError::System(SystemError::Io(e))),
            }
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.index.iter().map(|e| e.clone()).collect())
    }

    async fn acquire_due(
        &self,
        now: DateTime<Utc>,
        max_n: usize,
        queue_name: &str,
    ) -> Result<Vec<QueueEntry>> {
        let mut candidates: Vec<(QueueId, crate::entry::Priority, DateTime<Utc>)> = self
            .index
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
            let snapshot = {
                let Some(mut entry) = self.index.get_mut(&id) else {
                    continue;
                };
                if !entry.is_due(now) {
                    continue;
                }
                entry.status = QueueStatus::InProgress;
                entry.clone()
            };
            // Persist outside the map lock; a crash between mark and
            // persist only means the entry is retried after restart
            self.persist(&snapshot).await?;
            acquired.push(snapshot);
        }

        Ok(acquired)
    }
}
