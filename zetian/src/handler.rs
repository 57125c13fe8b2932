//! The server's `MailHandler`: relay authorization, SASL credential
//! checks, and the accept path (anti-abuse pipeline, message store,
//! relay queue, cluster hooks).

use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use zetian_cluster::Coordinator;
use zetian_common::{Address, Domain, FilterAction, SessionInfo, SessionRegistryRecord};
use zetian_delivery::{Priority, RelayQueue, OUTBOUND_QUEUE, QUARANTINE_QUEUE};
use zetian_filter::{Pipeline, PipelineOutcome};
use zetian_smtp::{
    extensions::Mechanism, AuthResult, MailHandler, MessageDisposition, RelayDecision,
    SealedMessage,
};
use zetian_store::MessageStore;

use crate::{
    config::ZetianConfig,
    events::{EventBus, ServerEvent},
};

pub struct ZetianHandler {
    config: ZetianConfig,
    pipeline: Pipeline,
    store: Arc<dyn MessageStore>,
    queue: RelayQueue,
    cluster: Option<Arc<Coordinator>>,
    events: EventBus,
}

impl ZetianHandler {
    #[must_use]
    pub fn new(
        config: ZetianConfig,
        pipeline: Pipeline,
        store: Arc<dyn MessageStore>,
        queue: RelayQueue,
        cluster: Option<Arc<Coordinator>>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            pipeline,
            store,
            queue,
            cluster,
            events,
        }
    }

    /// Split recipients into local mailboxes and relay targets.
    fn split_recipients(&self, recipients: &[Address]) -> (Vec<Address>, Vec<Address>) {
        recipients.iter().cloned().partition(|recipient| {
            self.config.relay.is_local_domain(recipient.domain())
        })
    }
}

#[async_trait]
impl MailHandler for ZetianHandler {
    async fn on_session_start(&self, record: &SessionRegistryRecord) {
        self.events.emit(ServerEvent::SessionStarted {
            session_id: record.session_id.clone(),
            remote_ip: record.remote_ip,
        });

        if let Some(cluster) = &self.cluster {
            cluster.register_session(record.clone()).await;
        }
    }

    async fn on_session_end(&self, record: &SessionRegistryRecord) {
        self.events.emit(ServerEvent::SessionEnded {
            session_id: record.session_id.clone(),
            messages: record.message_count,
        });

        if let Some(cluster) = &self.cluster {
            cluster.remove_session(&record.session_id).await;
        }
    }

    /// Relay is allowed for local domains, configured relay domains,
    /// allowed client networks, or authenticated sessions. Everyone
    /// else is denied.
    async fn relay_allowed(
        &self,
        _recipient: &Address,
        domain: &Domain,
        remote_ip: IpAddr,
        authenticated: bool,
    ) -> RelayDecision {
        let relay = &self.config.relay;

        if relay.is_local_domain(domain) {
            return RelayDecision::Local;
        }
        if relay.is_relay_domain(domain) || relay.ip_may_relay(remote_ip) || authenticated {
            return RelayDecision::Relay;
        }

        RelayDecision::Denied
    }

    async fn on_authenticate(
        &self,
        _mechanism: Mechanism,
        identity: &str,
        secret: &str,
    ) -> AuthResult {
        let valid = self
            .config
            .server
            .users
            .get(identity)
            .is_some_and(|expected| expected == secret);

        if valid {
            self.events.emit(ServerEvent::AuthSucceeded {
                identity: identity.to_string(),
            });
            AuthResult::Accepted(identity.to_string())
        } else {
            self.events.emit(ServerEvent::AuthFailed {
                identity: identity.to_string(),
            });
            AuthResult::Rejected
        }
    }

    async fn on_message(
        &self,
        message: SealedMessage,
        info: &SessionInfo,
    ) -> MessageDisposition {
        let outcome = self
            .pipeline
            .run(&message.envelope, &message.body, info)
            .await;

        if let PipelineOutcome::Greylisted { retry_after } = outcome {
            self.events.emit(ServerEvent::MessageGreylisted {
                retry_after_secs: retry_after.as_secs(),
            });
            return MessageDisposition::TempFailed {
                reason: format!("greylisted, retry after {}s", retry_after.as_secs()),
            };
        }

        let reject_reason = outcome.reject_reason();
        let PipelineOutcome::Proceed { action, score, .. } = outcome else {
            unreachable!("greylist handled above");
        };

        if action == FilterAction::Reject {
            self.events.emit(ServerEvent::MessageReceived {
                envelope_id: message.envelope.id(),
                action,
                score,
            });
            return MessageDisposition::Rejected {
                reason: reject_reason,
            };
        }

        // Mark tags the message before it is persisted
        let envelope = if action == FilterAction::Mark {
            message.envelope.clone().with_prepended_headers(vec![
                ("X-Spam-Flag".to_string(), "YES".to_string()),
                ("X-Spam-Score".to_string(), format!("{score:.1}")),
            ])
        } else {
            message.envelope.clone()
        };

        // Persist exactly once; a store failure means nothing was
        // accepted
        let body_ref = match self
            .store
            .put(envelope.id(), &envelope, &message.body)
            .await
        {
            Ok(body_ref) => body_ref,
            Err(e) => {
                self.events.emit(ServerEvent::ErrorOccurred {
                    context: format!("message store: {e}"),
                });
                return MessageDisposition::TempFailed {
                    reason: "Message could not be stored, try again".to_string(),
                };
            }
        };

        let (local, remote) = self.split_recipients(envelope.recipients());

        // Local mailboxes are final deliveries; no queue entry exists
        // for them. Quarantined messages are parked instead, never
        // delivered.
        if action != FilterAction::Quarantine {
            for recipient in &local {
                if let Err(e) = self.store.deliver_local(&body_ref, recipient).await {
                    self.events.emit(ServerEvent::ErrorOccurred {
                        context: format!("local delivery: {e}"),
                    });
                }
            }
        }

        // Quarantined messages park whole in the quarantine queue;
        // otherwise only relay recipients enter the outbound queue
        let queue_name = if action == FilterAction::Quarantine {
            QUARANTINE_QUEUE
        } else {
            OUTBOUND_QUEUE
        };

        let wants_queue =
            action == FilterAction::Quarantine || !remote.is_empty();

        if wants_queue {
            let queued_envelope = if action == FilterAction::Quarantine || local.is_empty() {
                envelope.clone()
            } else {
                // Mixed local and relay recipients: the queue entry
                // carries the relay subset only
                zetian_common::Envelope::builder()
                    .from(envelope.from().cloned())
                    .recipients(remote.clone())
                    .size_bytes(envelope.size_bytes())
                    .remote_ip(envelope.remote_ip())
                    .authenticated_identity(
                        envelope.authenticated_identity().map(ToString::to_string),
                    )
                    .ehlo_name(envelope.ehlo_name().to_string())
                    .tls_state(envelope.tls_state())
                    .headers(envelope.headers().clone())
                    .body_ref(body_ref.clone())
                    .seal()
            };

            if let Err(e) = self.store.retain(&body_ref).await {
                self.events.emit(ServerEvent::ErrorOccurred {
                    context: format!("store retain: {e}"),
                });
            }

            // Relay-only bodies age out once the queue is done with
            // them; a local copy doubles as the mailbox and stays
            if local.is_empty() {
                let ttl = std::time::Duration::from_secs(
                    self.config.retry.message_lifetime_secs.saturating_mul(2),
                );
                let _ = self.store.set_ttl(&body_ref, ttl).await;
            }

            match self
                .queue
                .enqueue(queued_envelope, Priority::Normal, None, queue_name)
                .await
            {
                Ok(queue_id) => {
                    tracing::debug!(queue_id = %queue_id, queue = queue_name, "Message queued");
                }
                Err(e) => {
                    let _ = self.store.release(&body_ref).await;
                    self.events.emit(ServerEvent::ErrorOccurred {
                        context: format!("enqueue: {e}"),
                    });
                    return MessageDisposition::TempFailed {
                        reason: "Message could not be queued, try again".to_string(),
                    };
                }
            }
        }

        self.events.emit(ServerEvent::MessageReceived {
            envelope_id: envelope.id(),
            action,
            score,
        });

        MessageDisposition::Accepted
    }
}
