//! Message body persistence behind the `MessageStore` trait.
//!
//! The session engine writes accepted bodies here; the relay queue holds
//! references to them while deliveries are outstanding. Bodies are
//! refcounted by queue entries and removed once unreferenced and past
//! their TTL.

pub mod error;
pub mod file;
pub mod memory;

pub use error::{Result, StoreError};
pub use file::FileMessageStore;
pub use memory::MemoryMessageStore;

use std::time::Duration;

use async_trait::async_trait;
use zetian_common::{Address, BodyRef, Envelope, EnvelopeId};

/// Abstract store for `(id, envelope, body bytes)` with optional TTL.
///
/// Implementations must be safe for concurrent use; the session tasks and
/// the dispatcher workers all hold the same `Arc<dyn MessageStore>`.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Persist a body under `id` and return the handle to retrieve it.
    async fn put(&self, id: EnvelopeId, envelope: &Envelope, body: &[u8]) -> Result<BodyRef>;

    /// Fetch the raw body bytes.
    async fn get(&self, body_ref: &BodyRef) -> Result<Vec<u8>>;

    /// Fetch the envelope metadata stored alongside the body.
    async fn envelope(&self, body_ref: &BodyRef) -> Result<Envelope>;

    /// Remove the body regardless of refcount.
    async fn delete(&self, body_ref: &BodyRef) -> Result<()>;

    /// Attach a TTL after which an unreferenced body may be swept.
    ///
    /// Stores without TTL support treat this as a no-op.
    async fn set_ttl(&self, _body_ref: &BodyRef, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    /// Take a queue reference on the body.
    async fn retain(&self, body_ref: &BodyRef) -> Result<()>;

    /// Drop a queue reference. Unreferenced bodies whose TTL has lapsed
    /// are removed by the next sweep.
    async fn release(&self, body_ref: &BodyRef) -> Result<()>;

    /// Record final local delivery of the body to `recipient`.
    async fn deliver_local(&self, body_ref: &BodyRef, recipient: &Address) -> Result<()>;

    /// Mailboxes the body has been locally delivered to.
    async fn local_recipients(&self, body_ref: &BodyRef) -> Result<Vec<String>>;

    /// Remove unreferenced, expired bodies. Returns how many went away.
    async fn sweep_expired(&self) -> Result<usize>;

    /// Number of stored bodies.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
