//! File-backed message store.
//!
//! One bincode-encoded record per body, named `<envelope-id>.msg` inside
//! the spool directory. Envelope ids are ULIDs, so a directory listing is
//! already in arrival order. Refcounts are process state; on restart the
//! relay queue re-retains every body its reloaded entries reference.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use zetian_common::{Address, BodyRef, Envelope, EnvelopeId};

use crate::{MessageStore, Result, StoreError};

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    envelope: Envelope,
    body: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
    local_for: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FileMessageStore {
    directory: PathBuf,
    refcounts: Arc<DashMap<BodyRef, usize>>,
}

impl FileMessageStore {
    /// Open (creating if necessary) a store rooted at `directory`.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;

        let metadata = tokio::fs::metadata(&directory).await?;
        if !metadata.is_dir() {
            return Err(StoreError::Validation(format!(
                "Store path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(Self {
            directory,
            refcounts: Arc::new(DashMap::new()),
        })
    }

    fn path_for(&self, body_ref: &BodyRef) -> Result<PathBuf> {
        let name = body_ref.as_str();
        // Handles double as filenames; reject anything that could escape
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(StoreError::Validation(format!(
                "Invalid body handle: {name}"
            )));
        }
        Ok(self.directory.join(format!("{name}.msg")))
    }

    async fn read_record(&self, body_ref: &BodyRef) -> Result<StoredRecord> {
        let path = self.path_for(body_ref)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(body_ref.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let (record, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(record)
    }

    async fn write_record(&self, body_ref: &BodyRef, record: &StoredRecord) -> Result<()> {
        let path = self.path_for(body_ref)?;
        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        // Write-then-rename so a crash never leaves a torn record behind
        let tmp = path.with_extension("msg.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Handles of every stored body, oldest first.
    pub async fn list(&self) -> Result<Vec<BodyRef>> {
        let mut refs = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".msg") {
                if ulid::Ulid::from_string(stem).is_ok() {
                    refs.push(BodyRef::new(stem));
                }
            }
        }
        refs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(refs)
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn put(&self, id: EnvelopeId, envelope: &Envelope, body: &[u8]) -> Result<BodyRef> {
        let body_ref = BodyRef::new(id.to_string());
        let record = StoredRecord {
            envelope: envelope.clone(),
            body: body.to_vec(),
            expires_at: None,
            local_for: Vec::new(),
        };
        self.write_record(&body_ref, &record).await?;
        Ok(body_ref)
    }

    async fn get(&self, body_ref: &BodyRef) -> Result<Vec<u8>> {
        Ok(self.read_record(body_ref).await?.body)
    }

    async fn envelope(&self, body_ref: &BodyRef) -> Result<Envelope> {
        Ok(self.read_record(body_ref).await?.envelope)
    }

    async fn delete(&self, body_ref: &BodyRef) -> Result<()> {
        let path = self.path_for(body_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.refcounts.remove(body_ref);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(body_ref.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_ttl(&self, body_ref: &BodyRef, ttl: Duration) -> Result<()> {
        let mut record = self.read_record(body_ref).await?;
        record.expires_at = Utc::now().checked_add_signed(
            chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Validation(format!("TTL out of range: {e}")))?,
        );
        self.write_record(body_ref, &record).await
    }

    async fn retain(&self, body_ref: &BodyRef) -> Result<()> {
        if !self.path_for(body_ref)?.exists() {
            return Err(StoreError::NotFound(body_ref.clone()));
        }
        *self.refcounts.entry(body_ref.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn release(&self, body_ref: &BodyRef) -> Result<()> {
        if let Some(mut count) = self.refcounts.get_mut(body_ref) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn deliver_local(&self, body_ref: &BodyRef, recipient: &Address) -> Result<()> {
        let mut record = self.read_record(body_ref).await?;
        let mailbox = recipient.as_smtp_string();
        if !record.local_for.contains(&mailbox) {
            record.local_for.push(mailbox);
            self.write_record(body_ref, &record).await?;
        }
        Ok(())
    }

    async fn local_recipients(&self, body_ref: &BodyRef) -> Result<Vec<String>> {
        Ok(self.read_record(body_ref).await?.local_for)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for body_ref in self.list().await? {
            let referenced = self
                .refcounts
                .get(&body_ref)
                .map(|count| *count > 0)
                .unwrap_or(false);
            if referenced {
                continue;
            }

            let record = match self.read_record(&body_ref).await {
                Ok(record) => record,
                // Concurrently deleted; nothing to sweep
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            if record.expires_at.is_some_and(|at| at <= now) {
                if self.delete(&body_ref).await.is_ok() {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use zetian_common::HeaderMap;

    use super::*;

    fn envelope_for(body: &[u8]) -> Envelope {
        Envelope::builder()
            .from(Some(Address::parse("<a@x.example>").unwrap()))
            .recipients(vec![Address::parse("<u@local.example>").unwrap()])
            .size_bytes(body.len())
            .headers(HeaderMap::parse(body))
            .seal()
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"Subject: persistent\r\n\r\nbody\r\n";
        let envelope = envelope_for(body);

        let body_ref = {
            let store = FileMessageStore::open(dir.path()).await.unwrap();
            store.put(envelope.id(), &envelope, body).await.unwrap()
        };

        let reopened = FileMessageStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(&body_ref).await.unwrap(), body.to_vec());
        assert_eq!(
            reopened.envelope(&body_ref).await.unwrap().id(),
            envelope.id()
        );
    }

    #[tokio::test]
    async fn list_is_ordered_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMessageStore::open(dir.path()).await.unwrap();

        // A stray file must not be listed
        tokio::fs::write(dir.path().join("junk.txt"), b"noise")
            .await
            .unwrap();

        let body = b"Subject: x\r\n\r\n.";
        let mut ids = Vec::new();
        for _ in 0..3 {
            let envelope = envelope_for(body);
            ids.push(store.put(envelope.id(), &envelope, body).await.unwrap());
        }

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 3);
        let mut sorted = ids.clone();
        sorted.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(listed, sorted);
    }

    #[tokio::test]
    async fn rejects_escaping_handles() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMessageStore::open(dir.path()).await.unwrap();
        let evil = BodyRef::new("../etc/passwd");
        assert!(matches!(
            store.get(&evil).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn sweep_only_removes_expired_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMessageStore::open(dir.path()).await.unwrap();
        let body = b"Subject: x\r\n\r\n.";

        let keep = envelope_for(body);
        let keep_ref = store.put(keep.id(), &keep, body).await.unwrap();
        store.retain(&keep_ref).await.unwrap();
        store.set_ttl(&keep_ref, Duration::ZERO).await.unwrap();

        let drop_me = envelope_for(body);
        let drop_ref = store.put(drop_me.id(), &drop_me, body).await.unwrap();
        store.set_ttl(&drop_ref, Duration::ZERO).await.unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(store.get(&keep_ref).await.is_ok());
        assert!(store.get(&drop_ref).await.is_err());
    }
}
