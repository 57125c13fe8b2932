//! The relay queue: enqueue, due-selection, per-recipient outcome
//! recording, and retry/expiry bookkeeping over a `RelayStore`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Deserialize;
use zetian_common::Envelope;

use crate::{
    entry::{Outcome, Priority, QueueEntry, QueueId, QueueStatus, RecipientState},
    error::{DeliveryError, SystemError},
    retry::backoff_delay,
    store::{RelayStore, Result},
};

/// Retry and lifetime policy for queued mail.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Base backoff in seconds, doubled per attempt.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Backoff ceiling in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Jitter factor applied to every computed delay.
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
    /// Entries older than this expire.
    #[serde(default = "default_message_lifetime_secs")]
    pub message_lifetime_secs: u64,
}

const fn default_max_retry_count() -> u32 {
    25
}

const fn default_base_delay_secs() -> u64 {
    60
}

const fn default_max_delay_secs() -> u64 {
    86_400
}

const fn default_jitter() -> f64 {
    0.2
}

const fn default_message_lifetime_secs() -> u64 {
    5 * 24 * 3600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            jitter_factor: default_jitter(),
            message_lifetime_secs: default_message_lifetime_secs(),
        }
    }
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total_messages: usize,
    pub by_status: HashMap<String, usize>,
    pub oldest_message_age_secs: Option<u64>,
}

/// What `complete` decided for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Recipients remain pending; retry at the recorded time.
    Deferred,
    /// A terminal status was reached.
    Terminal(QueueStatus),
}

#[derive(Debug, Clone)]
pub struct RelayQueue {
    store: Arc<dyn RelayStore>,
    policy: RetryPolicy,
}

impl RelayQueue {
    #[must_use]
    pub fn new(store: Arc<dyn RelayStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue an envelope for delivery. Returns the queue id.
    pub async fn enqueue(
        &self,
        envelope: Envelope,
        priority: Priority,
        chosen_route: Option<String>,
        queue_name: &str,
    ) -> Result<QueueId> {
        self.enqueue_entry(envelope, priority, chosen_route, queue_name, false)
            .await
    }

    /// Queue a bounce: high priority, flagged so it never bounces again.
    pub async fn enqueue_bounce(&self, envelope: Envelope) -> Result<QueueId> {
        self.enqueue_entry(
            envelope,
            Priority::High,
            None,
            crate::OUTBOUND_QUEUE,
            true,
        )
        .await
    }

    async fn enqueue_entry(
        &self,
        envelope: Envelope,
        priority: Priority,
        chosen_route: Option<String>,
        queue_name: &str,
        suppress_bounce: bool,
    ) -> Result<QueueId> {
        let mut entry = QueueEntry::new(
            envelope,
            priority,
            chosen_route,
            Duration::from_secs(self.policy.message_lifetime_secs),
            queue_name,
        );
        entry.suppress_bounce = suppress_bounce;

        let id = entry.queue_id;
        self.store.insert(&entry).await?;
        tracing::debug!(queue_id = %id, queue = queue_name, "Enqueued");
        Ok(id)
    }

    /// Atomically take up to `max_n` due entries and own them.
    pub async fn pick_due(&self, max_n: usize) -> Result<Vec<QueueEntry>> {
        self.store
            .acquire_due(Utc::now(), max_n, crate::OUTBOUND_QUEUE)
            .await
    }

    /// Record one recipient's outcome for an in-progress entry.
    ///
    /// Idempotent: recording the same outcome twice leaves the entry in
    /// the same state as recording it once. Attempt counters move in
    /// `complete`, not here.
    pub async fn record(&self, id: QueueId, recipient: &str, outcome: Outcome) -> Result<()> {
        let mut entry = self.load(id).await?;

        let Some(delivery) = entry.per_recipient.get_mut(recipient) else {
            return Err(SystemError::Internal(format!(
                "Recipient {recipient} not part of entry {id}"
            ))
            .into());
        };

        // Terminal recipient states never regress
        if delivery.state != RecipientState::Pending {
            return Ok(());
        }

        match outcome {
            Outcome::Delivered => {
                delivery.state = RecipientState::Delivered;
                delivery.last_error = None;
                delivery.deferred_this_round = false;
            }
            Outcome::TempFail(reason) => {
                delivery.last_error = Some(reason);
                delivery.deferred_this_round = true;
            }
            Outcome::PermFail(reason) => {
                delivery.state = RecipientState::Failed;
                delivery.last_error = Some(reason);
                delivery.deferred_this_round = false;
            }
        }

        self.store.update(&entry).await
    }

    /// Close a delivery round: advance attempt counters, recompute the
    /// status from the per-recipient map, and either finish the entry or
    /// schedule its retry.
    pub async fn complete(&self, id: QueueId) -> Result<Completion> {
        let mut entry = self.load(id).await?;
        let now = Utc::now();

        entry.attempts += 1;
        entry.last_attempt_at = Some(now);

        // Recipients that temp-failed this round spend an attempt; past
        // the retry budget they fail for good
        for delivery in entry.per_recipient.values_mut() {
            if delivery.deferred_this_round {
                delivery.deferred_this_round = false;
                delivery.attempts += 1;
                if delivery.attempts > self.policy.max_retry_count {
                    delivery.state = RecipientState::Failed;
                    let exhausted = format!(
                        "Retry limit exceeded after {} attempts: {}",
                        delivery.attempts,
                        delivery.last_error.as_deref().unwrap_or("temporary failure")
                    );
                    delivery.last_error = Some(exhausted);
                }
            }
        }

        // Lifetime expiry fails everything still pending
        let completion = if entry.is_expired(now) && entry.terminal_status().is_none() {
            for delivery in entry.per_recipient.values_mut() {
                if delivery.state == RecipientState::Pending {
                    delivery.state = RecipientState::Failed;
                    delivery.last_error = Some("Message lifetime expired in queue".to_string());
                }
            }
            entry.status = QueueStatus::Expired;
            entry.next_due_at = None;
            Completion::Terminal(QueueStatus::Expired)
        } else if let Some(terminal) = entry.terminal_status() {
            entry.status = terminal;
            entry.next_due_at = None;
            Completion::Terminal(terminal)
        } else {
            let delay = backoff_delay(
                entry.attempts,
                Duration::from_secs(self.policy.base_delay_secs),
                Duration::from_secs(self.policy.max_delay_secs),
                self.policy.jitter_factor,
            );
            entry.status = QueueStatus::Deferred;
            entry.next_due_at = now.checked_add_signed(
                chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            );
            Completion::Deferred
        };

        tracing::debug!(queue_id = %id, status = ?entry.status, "Delivery round complete");
        self.store.update(&entry).await?;
        Ok(completion)
    }

    /// Whether a bounce should be generated for a finished entry.
    #[must_use]
    pub fn wants_bounce(entry: &QueueEntry) -> bool {
        matches!(entry.status, QueueStatus::Failed | QueueStatus::Expired)
            && !entry.suppress_bounce
            && !entry.envelope.is_null_sender()
    }

    pub async fn remove(&self, id: QueueId) -> Result<Option<QueueEntry>> {
        self.store.remove(id).await
    }

    pub async fn get(&self, id: QueueId) -> Result<Option<QueueEntry>> {
        self.store.get(id).await
    }

    /// Push an entry's next attempt out by `delay`.
    pub async fn reschedule(&self, id: QueueId, delay: Duration) -> Result<()> {
        let mut entry = self.load(id).await?;
        entry.status = QueueStatus::Deferred;
        entry.next_due_at = Utc::now().checked_add_signed(
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        self.store.update(&entry).await
    }

    /// Expire entries past their lifetime. Returns the expired entries
    /// so the caller can generate bounces.
    pub async fn clear_expired(&self) -> Result<Vec<QueueEntry>> {
        let now = Utc::now();
        let mut expired = Vec::new();

        for mut entry in self.store.list().await? {
            if entry.status.is_terminal()
                || entry.status == QueueStatus::InProgress
                || !entry.is_expired(now)
            {
                continue;
            }

            for delivery in entry.per_recipient.values_mut() {
                if delivery.state == RecipientState::Pending {
                    delivery.state = RecipientState::Failed;
                    delivery.last_error = Some("Message lifetime expired in queue".to_string());
                }
            }
            entry.status = QueueStatus::Expired;
            entry.next_due_at = None;
            self.store.update(&entry).await?;
            expired.push(entry);
        }

        Ok(expired)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let now = Utc::now();
        let mut stats = QueueStats::default();
        let mut oldest: Option<i64> = None;

        for entry in self.store.list().await? {
            stats.total_messages += 1;
            let key = format!("{:?}", entry.status).to_lowercase();
            *stats.by_status.entry(key).or_insert(0) += 1;

            if !entry.status.is_terminal() {
                let age = (now - entry.queued_at).num_seconds();
                oldest = Some(oldest.map_or(age, |o: i64| o.max(age)));
            }
        }

        stats.oldest_message_age_secs = oldest.and_then(|age| u64::try_from(age).ok());
        Ok(stats)
    }

    pub async fn get_all(&self) -> Result<Vec<QueueEntry>> {
        self.store.list().await
    }

    pub async fn get_by_status(&self, status: QueueStatus) -> Result<Vec<QueueEntry>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }

    async fn load(&self, id: QueueId) -> Result<QueueEntry> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| DeliveryError::System(SystemError::EntryNotFound(id.to_string())))
    }
}
