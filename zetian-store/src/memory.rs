//! In-memory backing store.
//!
//! Primarily for tests and embedded use; everything lives in a `DashMap`
//! keyed by the body handle. Refcounts and TTLs behave exactly as the
//! file-backed store, so the two are interchangeable behind the trait.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use zetian_common::{Address, BodyRef, Envelope, EnvelopeId};

use crate::{MessageStore, Result, StoreError};

#[derive(Debug)]
struct StoredBody {
    envelope: Envelope,
    body: Arc<[u8]>,
    refcount: AtomicUsize,
    expires_at: Option<DateTime<Utc>>,
    local_for: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    bodies: Arc<DashMap<BodyRef, StoredBody>>,
    /// Maximum number of bodies to hold (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bodies: Arc::new(DashMap::new()),
            capacity: Some(capacity),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn put(&self, id: EnvelopeId, envelope: &Envelope, body: &[u8]) -> Result<BodyRef> {
        let body_ref = BodyRef::new(id.to_string());

        if let Some(cap) = self.capacity {
            if !self.bodies.contains_key(&body_ref) && self.bodies.len() >= cap {
                return Err(StoreError::Internal(format!(
                    "Memory store capacity exceeded: {}/{cap} bodies",
                    self.bodies.len()
                )));
            }
        }

        self.bodies.insert(
            body_ref.clone(),
            StoredBody {
                envelope: envelope.clone(),
                body: Arc::from(body),
                refcount: AtomicUsize::new(0),
                expires_at: None,
                local_for: Vec::new(),
            },
        );

        Ok(body_ref)
    }

    async fn get(&self, body_ref: &BodyRef) -> Result<Vec<u8>> {
        self.bodies
            .get(body_ref)
            .map(|entry| entry.body.to_vec())
            .ok_or_else(|| StoreError::NotFound(body_ref.clone()))
    }

    async fn envelope(&self, body_ref: &BodyRef) -> Result<Envelope> {
        self.bodies
            .get(body_ref)
            .map(|entry| entry.envelope.clone())
            .ok_or_else(|| StoreError::NotFound(body_ref.clone()))
    }

    async fn delete(&self, body_ref: &BodyRef) -> Result<()> {
        self.bodies
            .remove(body_ref)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(body_ref.clone()))
    }

    async fn set_ttl(&self, body_ref: &BodyRef, ttl: Duration) -> Result<()> {
        let mut entry = self
            .bodies
            .get_mut(body_ref)
            .ok_or_else(|| StoreError::NotFound(body_ref.clone()))?;
        entry.expires_at = Utc::now().checked_add_signed(
            chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Validation(format!("TTL out of range: {e}")))?,
        );
        Ok(())
    }

    async fn retain(&self, body_ref: &BodyRef) -> Result<()> {
        let entry = self
            .bodies
            .get(body_ref)
            .ok_or_else(|| StoreError::NotFound(body_ref.clone()))?;
        entry.refcount.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, body_ref: &BodyRef) -> Result<()> {
        let entry = self
            .bodies
            .get(body_ref)
            .ok_or_else(|| StoreError::NotFound(body_ref.clone()))?;
        // Saturating: releasing more than retained is a caller bug but
        // must not wrap the count into permanence
        entry
            .refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(1))
            })
            .ok();
        Ok(())
    }

    async fn deliver_local(&self, body_ref: &BodyRef, recipient: &Address) -> Result<()> {
        let mut entry = self
            .bodies
            .get_mut(body_ref)
            .ok_or_else(|| StoreError::NotFound(body_ref.clone()))?;
        let mailbox = recipient.as_smtp_string();
        if !entry.local_for.contains(&mailbox) {
            entry.local_for.push(mailbox);
        }
        Ok(())
    }

    async fn local_recipients(&self, body_ref: &BodyRef) -> Result<Vec<String>> {
        self.bodies
            .get(body_ref)
            .map(|entry| entry.local_for.clone())
            .ok_or_else(|| StoreError::NotFound(body_ref.clone()))
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let before = self.bodies.len();
        self.bodies.retain(|_, stored| {
            let unreferenced = stored.refcount.load(Ordering::SeqCst) == 0;
            let expired = stored.expires_at.is_some_and(|at| at <= now);
            !(unreferenced && expired)
        });
        Ok(before - self.bodies.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.bodies.len())
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
    async fn put_get_delete() {
        let store = MemoryMessageStore::new();
        let body = b"Subject: hi\r\n\r\nbody\r\n";
        let envelope = envelope_for(body);

        let body_ref = store.put(envelope.id(), &envelope, body).await.unwrap();
        assert_eq!(store.get(&body_ref).await.unwrap(), body.to_vec());
        assert_eq!(
            store.envelope(&body_ref).await.unwrap().id(),
            envelope.id()
        );

        store.delete(&body_ref).await.unwrap();
        assert!(matches!(
            store.get(&body_ref).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn capacity_enforced() {
        let store = MemoryMessageStore::with_capacity(1);
        let body = b"Subject: a\r\n\r\n.";
        let first = envelope_for(body);
        store.put(first.id(), &first, body).await.unwrap();

        let second = envelope_for(body);
        assert!(store.put(second.id(), &second, body).await.is_err());
    }

    #[tokio::test]
    async fn sweep_respects_refcount_and_ttl() {
        let store = MemoryMessageStore::new();
        let body = b"Subject: hi\r\n\r\nbody\r\n";
        let envelope = envelope_for(body);
        let body_ref = store.put(envelope.id(), &envelope, body).await.unwrap();

        store.retain(&body_ref).await.unwrap();
        store.set_ttl(&body_ref, Duration::ZERO).await.unwrap();

        // Referenced: survives even though expired
        assert_eq!(store.sweep_expired().await.unwrap(), 0);

        store.release(&body_ref).await.unwrap();
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn no_ttl_means_no_sweep() {
        let store = MemoryMessageStore::new();
        let body = b"Subject: hi\r\n\r\nbody\r\n";
        let envelope = envelope_for(body);
        let body_ref = store.put(envelope.id(), &envelope, body).await.unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 0);
        assert!(store.get(&body_ref).await.is_ok());
    }

    #[tokio::test]
    async fn local_delivery_tags() {
        let store = MemoryMessageStore::new();
        let body = b"Subject: hi\r\n\r\nbody\r\n";
        let envelope = envelope_for(body);
        let body_ref = store.put(envelope.id(), &envelope, body).await.unwrap();

        let rcpt = Address::parse("<u@local.example>").unwrap();
        store.deliver_local(&body_ref, &rcpt).await.unwrap();
        store.deliver_local(&body_ref, &rcpt).await.unwrap();

        assert_eq!(
            store.local_recipients(&body_ref).await.unwrap(),
            vec!["u@local.example".to_string()]
        );
    }
}
