//! Relay queue and dispatcher for outbound mail.
//!
//! The queue is a persistent, priority-ordered set of envelopes with
//! per-recipient delivery state; the dispatcher pulls due entries on an
//! interval, routes each recipient, runs outbound SMTP transactions, and
//! schedules retries or bounces.

pub mod bounce;
pub mod config;
pub mod dns;
pub mod entry;
pub mod error;
pub mod file_store;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod route;
pub mod store;
pub mod transaction;

pub use bounce::{Bounce, BounceConfig};
pub use config::{Network, RelayOptions, SmartHost};
pub use pool::ConnectionPool;
pub use dns::{MailServer, MxResolver};
pub use entry::{
    Outcome, Priority, QueueEntry, QueueId, QueueStatus, RecipientDelivery, RecipientState,
};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use file_store::FileRelayStore;
pub use processor::DeliveryProcessor;
pub use queue::{Completion, QueueStats, RelayQueue, RetryPolicy};
pub use route::{RouteDecision, Router};
pub use store::{MemoryRelayStore, RelayStore};

/// Name of the queue the dispatcher drains.
pub const OUTBOUND_QUEUE: &str = "outbound";

/// Quarantined messages are parked here and never dispatched.
pub const QUARANTINE_QUEUE: &str = "quarantine";
