//! The relay dispatcher.
//!
//! On each processing tick, pulls as many due entries as free worker
//! slots allow, routes every pending recipient, runs the outbound
//! transactions, records per-recipient outcomes, and completes the
//! entry. A separate cleanup tick expires overdue entries and sweeps
//! unreferenced bodies.

use std::{sync::Arc, time::Duration};

use tokio::sync::Semaphore;
use zetian_common::{internal, Address, Signal};
use zetian_store::MessageStore;

use crate::{
    bounce::{self, BounceConfig},
    entry::{Outcome, QueueEntry},
    error::DeliveryError,
    pool::ConnectionPool,
    queue::{Completion, RelayQueue},
    route::{HostTarget, RouteDecision, Router},
    transaction,
};

pub struct DeliveryProcessor {
    queue: RelayQueue,
    router: Arc<Router>,
    store: Arc<dyn MessageStore>,
    pool: Arc<ConnectionPool>,
    bounce_config: BounceConfig,
    workers: Arc<Semaphore>,
    max_concurrent: usize,
}

impl DeliveryProcessor {
    #[must_use]
    pub fn new(
        queue: RelayQueue,
        router: Router,
        store: Arc<dyn MessageStore>,
        bounce_config: BounceConfig,
    ) -> Self {
        let options = router.options();
        let max_concurrent = options.max_concurrent_deliveries.max(1);
        let pool = Arc::new(ConnectionPool::new(
            options.max_connections_per_host,
            options.max_messages_per_connection,
        ));

        Self {
            queue,
            router: Arc::new(router),
            store,
            pool,
            bounce_config,
            workers: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &RelayQueue {
        &self.queue
    }

    /// Run until shutdown, then drain in-flight deliveries for up to
    /// `drain_window`.
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
        drain_window: Duration,
    ) -> Result<(), DeliveryError> {
        internal!("Delivery processor starting");

        let options = self.router.options();
        let mut process_timer = tokio::time::interval(Duration::from_secs(
            options.queue_processing_interval_secs.max(1),
        ));
        let mut cleanup_timer =
            tokio::time::interval(Duration::from_secs(options.cleanup_interval_secs.max(1)));

        // Skip the immediate first ticks
        process_timer.tick().await;
        cleanup_timer.tick().await;

        loop {
            tokio::select! {
                _ = process_timer.tick() => {
                    if let Err(e) = self.process_once().await {
                        tracing::error!("Error processing delivery queue: {e}");
                    }
                }
                _ = cleanup_timer.tick() => {
                    if let Err(e) = self.cleanup_once().await {
                        tracing::error!("Error during queue cleanup: {e}");
                    }
                }
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        internal!("Delivery processor shutting down");
                        break;
                    }
                }
            }
        }

        self.drain(drain_window).await;
        Ok(())
    }

    /// Wait for in-flight deliveries to finish, up to `window`.
    async fn drain(&self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        while self.workers.available_permits() < self.max_concurrent {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Drain window expired with deliveries still in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// One processing tick: dispatch up to the free worker count.
    pub async fn process_once(&self) -> Result<usize, DeliveryError> {
        let free = self.workers.available_permits();
        if free == 0 {
            return Ok(0);
        }

        let entries = self.queue.pick_due(free).await?;
        let dispatched = entries.len();

        for entry in entries {
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .expect("worker semaphore never closes");

            let queue = self.queue.clone();
            let router = Arc::clone(&self.router);
            let store = Arc::clone(&self.store);
            let pool = Arc::clone(&self.pool);
            let bounce_config = self.bounce_config.clone();

            tokio::spawn(async move {
                let queue_id = entry.queue_id;
                if let Err(e) =
                    deliver_entry(&queue, &router, &store, &pool, &bounce_config, entry).await
                {
                    // One bad envelope must never stall the dispatcher
                    tracing::error!(queue_id = %queue_id, "Delivery failed: {e}");
                }
                drop(permit);
            });
        }

        Ok(dispatched)
    }

    /// One cleanup tick: expire overdue entries (bouncing them where
    /// allowed) and sweep unreferenced stored bodies.
    pub async fn cleanup_once(&self) -> Result<(), DeliveryError> {
        let expired = self.queue.clear_expired().await?;
        for entry in expired {
            finish_terminal_entry(
                &self.queue,
                &self.store,
                &self.bounce_config,
                self.router.options().enable_bounce_messages,
                &entry,
            )
            .await;
        }

        let swept = self.store.sweep_expired().await?;
        if swept > 0 {
            tracing::debug!(count = swept, "Swept expired message bodies");
        }

        Ok(())
    }
}

/// Deliver one queue entry end to end.
async fn deliver_entry(
    queue: &RelayQueue,
    router: &Router,
    store: &Arc<dyn MessageStore>,
    pool: &ConnectionPool,
    bounce_config: &BounceConfig,
    entry: QueueEntry,
) -> Result<(), DeliveryError> {
    let pending = entry.pending_recipients();
    tracing::debug!(
        queue_id = %entry.queue_id,
        recipients = pending.len(),
        "Dispatching entry"
    );

    // Group pending recipients by domain; one route decision (and
    // usually one outbound session) serves the whole group
    let mut by_domain: ahash::AHashMap<zetian_common::Domain, Vec<String>> =
        ahash::AHashMap::new();
    for recipient in pending {
        match Address::parse(&recipient) {
            Ok(addr) => by_domain
                .entry(addr.domain().clone())
                .or_default()
                .push(recipient),
            Err(e) => {
                queue
                    .record(
                        entry.queue_id,
                        &recipient,
                        Outcome::PermFail(format!("Unroutable recipient: {e}")),
                    )
                    .await?;
            }
        }
    }

    for (domain, recipients) in by_domain {
        // An operator-chosen route on the entry overrides the ladder
        let decision = if let Some(chosen) = &entry.chosen_route {
            Ok(RouteDecision::Remote {
                targets: vec![HostTarget::plain(chosen)],
                via: "chosen",
            })
        } else {
            router.select(&domain).await
        };

        match decision {
            Ok(RouteDecision::Local) => {
                deliver_local(queue, store, &entry, &recipients).await?;
            }
            Ok(RouteDecision::Remote { targets, via }) => {
                let body = match store.get(entry.envelope.body_ref()).await {
                    Ok(body) => body,
                    Err(e) => {
                        for recipient in &recipients {
                            queue
                                .record(
                                    entry.queue_id,
                                    recipient,
                                    Outcome::TempFail(format!("Body unavailable: {e}")),
                                )
                                .await?;
                        }
                        continue;
                    }
                };

                tracing::debug!(
                    queue_id = %entry.queue_id,
                    domain = %domain,
                    via,
                    targets = targets.len(),
                    "Routing"
                );

                let outcomes = transaction::deliver(
                    pool,
                    &targets,
                    &entry.envelope,
                    &body,
                    &recipients,
                    router.options(),
                )
                .await;

                for (recipient, outcome) in outcomes {
                    queue.record(entry.queue_id, &recipient, outcome).await?;
                }
            }
            Err(e) => {
                let outcome = if e.is_permanent() {
                    Outcome::PermFail(e.to_string())
                } else {
                    Outcome::TempFail(e.to_string())
                };
                for recipient in &recipients {
                    queue
                        .record(entry.queue_id, recipient, outcome.clone())
                        .await?;
                }
            }
        }
    }

    let completion = queue.complete(entry.queue_id).await?;

    if let Completion::Terminal(_) = completion {
        let finished = queue
            .get(entry.queue_id)
            .await?
            .unwrap_or(entry);
        finish_terminal_entry(
            queue,
            store,
            bounce_config,
            router.options().enable_bounce_messages,
            &finished,
        )
        .await;
    }

    Ok(())
}

async fn deliver_local(
    queue: &RelayQueue,
    store: &Arc<dyn MessageStore>,
    entry: &QueueEntry,
    recipients: &[String],
) -> Result<(), DeliveryError> {
    for recipient in recipients {
        let outcome = match Address::parse(recipient) {
            Ok(addr) => match store.deliver_local(entry.envelope.body_ref(), &addr).await {
                Ok(()) => Outcome::Delivered,
                Err(e) => Outcome::TempFail(format!("Local delivery failed: {e}")),
            },
            Err(e) => Outcome::PermFail(format!("Bad local recipient: {e}")),
        };
        queue.record(entry.queue_id, recipient, outcome).await?;
    }
    Ok(())
}

/// Terminal bookkeeping: generate the bounce when allowed and release
/// the entry's claim on the stored body.
async fn finish_terminal_entry(
    queue: &RelayQueue,
    store: &Arc<dyn MessageStore>,
    bounce_config: &BounceConfig,
    bounces_enabled: bool,
    entry: &QueueEntry,
) {
    if bounces_enabled && RelayQueue::wants_bounce(entry) {
        if let Some(bounce) = bounce::generate(entry, bounce_config) {
            let id = bounce.envelope.id();
            match store.put(id, &bounce.envelope, &bounce.body).await {
                Ok(body_ref) => {
                    let _ = store.retain(&body_ref).await;
                    let _ = store
                        .set_ttl(&body_ref, std::time::Duration::from_secs(7 * 24 * 3600))
                        .await;
                    match queue.enqueue_bounce(bounce.envelope).await {
                        Ok(bounce_id) => {
                            tracing::info!(
                                queue_id = %entry.queue_id,
                                bounce_id = %bounce_id,
                                "Bounce enqueued"
                            );
                        }
                        Err(e) => {
                            tracing::error!("Failed to enqueue bounce: {e}");
                            let _ = store.release(&body_ref).await;
                        }
                    }
                }
                Err(e) => tracing::error!("Failed to store bounce body: {e}"),
            }
        }
    }

    if let Err(e) = store.release(entry.envelope.body_ref()).await {
        tracing::debug!(queue_id = %entry.queue_id, "Body release: {e}");
    }
}
