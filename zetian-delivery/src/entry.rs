//! Queue entry types and their status invariants.

use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zetian_common::Envelope;

/// Queue identifier, distinct from the envelope id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(ulid::Ulid);

impl QueueId {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn parse(s: &str) -> Option<Self> {
        ulid::Ulid::from_string(s).ok().map(Self)
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    Queued,
    InProgress,
    Deferred,
    Delivered,
    Failed,
    Expired,
    Cancelled,
    PartiallyDelivered,
}

impl QueueStatus {
    /// No further delivery work will happen in this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Delivered
                | Self::Failed
                | Self::Expired
                | Self::Cancelled
                | Self::PartiallyDelivered
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecipientState {
    #[default]
    Pending,
    Delivered,
    Failed,
}

/// Per-recipient delivery progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientDelivery {
    pub state: RecipientState,
    pub last_error: Option<String>,
    pub attempts: u32,
    /// Set by `record(TempFail)` and consumed by `complete`, which is
    /// what makes `record` idempotent within a delivery round.
    pub(crate) deferred_this_round: bool,
}

/// Result of one delivery attempt for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    TempFail(String),
    PermFail(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_id: QueueId,
    pub envelope: Envelope,
    pub priority: Priority,
    pub status: QueueStatus,
    pub per_recipient: AHashMap<String, RecipientDelivery>,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_due_at: Option<DateTime<Utc>>,
    pub chosen_route: Option<String>,
    /// Seconds; entries older than this expire on the next scan.
    pub max_lifetime_secs: u64,
    /// Bounces carry this so they can never generate further bounces.
    pub suppress_bounce: bool,
    /// Which named queue the entry belongs to (outbound, quarantine).
    pub queue_name: String,
}

impl QueueEntry {
    #[must_use]
    pub fn new(
        envelope: Envelope,
        priority: Priority,
        chosen_route: Option<String>,
        max_lifetime: Duration,
        queue_name: impl Into<String>,
    ) -> Self {
        let per_recipient = envelope
            .recipients()
            .iter()
            .map(|r| (r.as_smtp_string(), RecipientDelivery::default()))
            .collect();

        Self {
            queue_id: QueueId::generate(),
            envelope,
            priority,
            status: QueueStatus::Queued,
            per_recipient,
            attempts: 0,
            queued_at: Utc::now(),
            last_attempt_at: None,
            next_due_at: None,
            chosen_route,
            max_lifetime_secs: max_lifetime.as_secs(),
            suppress_bounce: false,
            queue_name: queue_name.into(),
        }
    }

    /// Recipients still awaiting delivery.
    #[must_use]
    pub fn pending_recipients(&self) -> Vec<String> {
        self.per_recipient
            .iter()
            .filter(|(_, d)| d.state == RecipientState::Pending)
            .map(|(r, _)| r.clone())
            .collect()
    }

    /// Recipients that ended in failure, with their last errors.
    #[must_use]
    pub fn failed_recipients(&self) -> Vec<(String, String)> {
        self.per_recipient
            .iter()
            .filter(|(_, d)| d.state == RecipientState::Failed)
            .map(|(r, d)| {
                (
                    r.clone(),
                    d.last_error.clone().unwrap_or_else(|| "unknown error".to_string()),
                )
            })
            .collect()
    }

    /// The terminal status matching the per-recipient map, if every
    /// recipient is terminal.
    #[must_use]
    pub fn terminal_status(&self) -> Option<QueueStatus> {
        let mut delivered = 0;
        let mut failed = 0;
        for delivery in self.per_recipient.values() {
            match delivery.state {
                RecipientState::Pending => return None,
                RecipientState::Delivered => delivered += 1,
                RecipientState::Failed => failed += 1,
            }
        }

        Some(if failed == 0 {
            QueueStatus::Delivered
        } else if delivered == 0 {
            QueueStatus::Failed
        } else {
            QueueStatus::PartiallyDelivered
        })
    }

    /// Whether the entry has outlived `max_lifetime`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let lifetime = chrono::Duration::seconds(
            i64::try_from(self.max_lifetime_secs).unwrap_or(i64::MAX),
        );
        self.queued_at + lifetime < now
    }

    /// Eligible for `pick_due`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            QueueStatus::Queued => true,
            QueueStatus::Deferred => self.next_due_at.is_none_or(|due| due <= now),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use zetian_common::Address;

    use super::*;

    fn entry_with_recipients(recipients: &[&str]) -> QueueEntry {
        let envelope = Envelope::builder()
            .from(Some(Address::parse("<a@x.example>").unwrap()))
            .recipients(
                recipients
                    .iter()
                    .map(|r| Address::parse(r).unwrap())
                    .collect(),
            )
            .seal();
        QueueEntry::new(
            envelope,
            Priority::Normal,
            None,
            Duration::from_secs(3600),
            "outbound",
        )
    }

    #[test]
    fn terminal_status_agrees_with_recipient_map() {
        let mut entry = entry_with_recipients(&["<a@x.example>", "<b@x.example>"]);
        assert_eq!(entry.terminal_status(), None);

        entry.per_recipient.get_mut("a@x.example").unwrap().state = RecipientState::Delivered;
        assert_eq!(entry.terminal_status(), None);

        entry.per_recipient.get_mut("b@x.example").unwrap().state = RecipientState::Delivered;
        assert_eq!(entry.terminal_status(), Some(QueueStatus::Delivered));

        entry.per_recipient.get_mut("b@x.example").unwrap().state = RecipientState::Failed;
        assert_eq!(
            entry.terminal_status(),
            Some(QueueStatus::PartiallyDelivered)
        );

        entry.per_recipient.get_mut("a@x.example").unwrap().state = RecipientState::Failed;
        assert_eq!(entry.terminal_status(), Some(QueueStatus::Failed));
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn due_and_expiry() {
        let mut entry = entry_with_recipients(&["<a@x.example>"]);
        let now = Utc::now();

        assert!(entry.is_due(now));
        assert!(!entry.is_expired(now));

        entry.status = QueueStatus::Deferred;
        entry.next_due_at = Some(now + chrono::Duration::seconds(60));
        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + chrono::Duration::seconds(61)));

        entry.max_lifetime_secs = 10;
        assert!(entry.is_expired(now + chrono::Duration::seconds(11)));
    }
}
