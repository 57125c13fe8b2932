//! Server assembly and lifecycle.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use zetian_cluster::Coordinator;
use zetian_common::{internal, Signal};
use zetian_delivery::{
    BounceConfig, DeliveryProcessor, FileRelayStore, MemoryRelayStore, RelayQueue, RelayStore,
    Router,
};
use zetian_filter::{
    BayesClassifier, BayesScorer, DkimScorer, DmarcScorer, DnsClient, Greylist, Pipeline,
    RecordSource, SpfScorer,
};
use zetian_smtp::{Extension, Listener, ListenerConfig, Mechanism, SessionConfig, TlsContext};
use zetian_store::{FileMessageStore, MemoryMessageStore, MessageStore};

use crate::{
    config::ZetianConfig,
    events::EventBus,
    handler::ZetianHandler,
};

pub struct Server {
    config: ZetianConfig,
    shutdown: tokio::sync::broadcast::Sender<Signal>,
    events: EventBus,
}

impl Server {
    #[must_use]
    pub fn new(config: ZetianConfig) -> Self {
        let (shutdown, _) = tokio::sync::broadcast::channel(16);
        Self {
            config,
            shutdown,
            events: EventBus::new(),
        }
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Ask the server to stop: listeners stop accepting, idle sessions
    /// close, and in-flight work drains within the configured window.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(Signal::Shutdown);
    }

    #[must_use]
    pub fn shutdown_sender(&self) -> tokio::sync::broadcast::Sender<Signal> {
        self.shutdown.clone()
    }

    fn session_extensions(&self) -> Vec<Extension> {
        let server = &self.config.server;
        let mut extensions = vec![
            Extension::Pipelining,
            Extension::EightBitMime,
            Extension::Size(server.max_message_size),
            Extension::SmtpUtf8,
            Extension::Chunking,
            Extension::BinaryMime,
            Extension::EnhancedStatusCodes,
            Extension::Help,
        ];

        if let (Some(certificate), Some(key)) = (&server.certificate, &server.certificate_key) {
            extensions.push(Extension::Starttls(TlsContext {
                certificate: certificate.clone(),
                key: key.clone(),
            }));
        }

        let mechanisms: Vec<Mechanism> = server
            .authentication_mechanisms
            .iter()
            .filter_map(|m| match m.to_ascii_uppercase().as_str() {
                "PLAIN" => Some(Mechanism::Plain),
                "LOGIN" => Some(Mechanism::Login),
                other => {
                    tracing::warn!("Ignoring unsupported SASL mechanism {other}");
                    None
                }
            })
            .collect();
        if !mechanisms.is_empty() && !server.users.is_empty() {
            extensions.push(Extension::Auth(mechanisms));
        }

        extensions
    }

    fn build_pipeline(&self, dns: &Arc<dyn RecordSource>) -> Pipeline {
        let filter = &self.config.filter;
        let mut pipeline = Pipeline::new(filter.thresholds);

        if filter.enable_spf {
            pipeline = pipeline.with_scorer(
                Arc::new(SpfScorer::new(Arc::clone(dns), filter.spf_scores)),
                filter.spf_weight,
            );
        }
        if filter.enable_dkim {
            pipeline = pipeline.with_scorer(
                Arc::new(DkimScorer::new(Arc::clone(dns)).strict(filter.dkim_strict)),
                filter.dkim_weight,
            );
        }
        if filter.enable_dmarc {
            pipeline = pipeline.with_scorer(
                Arc::new(DmarcScorer::new(Arc::clone(dns)).enforce(filter.dmarc_enforce)),
                filter.dmarc_weight,
            );
        }
        if filter.enable_bayes {
            let classifier = Arc::new(BayesClassifier::new(filter.bayes));
            pipeline =
                pipeline.with_scorer(Arc::new(BayesScorer::new(classifier)), filter.bayes_weight);
        }
        if filter.enable_greylist {
            pipeline = pipeline.with_greylist(Arc::new(Greylist::new(filter.greylist)));
        }

        pipeline
    }

    /// Run everything until shutdown.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let config = &self.config;

        // Stores
        let store: Arc<dyn MessageStore> = match &config.storage.message_store_path {
            Some(path) => Arc::new(FileMessageStore::open(path).await?),
            None => Arc::new(MemoryMessageStore::new()),
        };
        let relay_store: Arc<dyn RelayStore> = match &config.storage.queue_path {
            Some(path) => Arc::new(FileRelayStore::open(path).await?),
            None => Arc::new(MemoryRelayStore::new()),
        };
        let queue = RelayQueue::new(relay_store, config.retry);

        // Restart safety: every entry still holding a body keeps its
        // reference so the sweep cannot take the bodies out from under
        // the queue
        for entry in queue.get_all().await? {
            if !entry.status.is_terminal() {
                let _ = store.retain(entry.envelope.body_ref()).await;
            }
        }

        // Anti-abuse
        let dns: Arc<dyn RecordSource> = if config.filter.dns_servers.is_empty() {
            Arc::new(DnsClient::system())
        } else {
            Arc::new(DnsClient::with_servers(&config.filter.dns_servers))
        };
        let pipeline = self.build_pipeline(&dns);
        let greylist = pipeline.greylist().cloned();

        // Cluster (optional)
        let cluster = config.cluster.clone().map(Coordinator::new);

        // Dispatcher
        let bounce_config = BounceConfig {
            reporting_mta: config.server.server_name.clone(),
            postmaster: config.relay.bounce_sender.clone(),
            include_dsn: config.relay.enable_dsn,
        };
        let processor = Arc::new(DeliveryProcessor::new(
            queue.clone(),
            Router::new(config.relay.clone()),
            Arc::clone(&store),
            bounce_config,
        ));

        // Session handler
        let node_id = config
            .cluster
            .as_ref()
            .map(|c| c.node_id.clone())
            .unwrap_or_default();
        let handler = Arc::new(ZetianHandler::new(
            config.clone(),
            pipeline,
            Arc::clone(&store),
            queue.clone(),
            cluster.clone(),
            self.events.clone(),
        ));

        let greeting = config
            .server
            .banner
            .clone()
            .unwrap_or_else(|| config.server.greeting.clone());
        let session_config = SessionConfig::builder()
            .with_extensions(self.session_extensions())
            .with_banner(config.server.server_name.clone())
            .with_greeting(greeting)
            .with_timeouts(config.server.timeouts)
            .with_max_recipients(config.server.max_recipients)
            .with_require_authentication(config.server.require_authentication)
            .with_require_secure_connection(config.server.require_secure_connection)
            .with_allow_plaintext_auth(config.server.allow_plaintext_authentication)
            .with_node_id(node_id)
            .build();

        let listener = Listener::new(
            ListenerConfig {
                bind: SocketAddr::new(config.server.bind_address, config.server.port),
                max_connections: config.server.max_connections,
                max_connections_per_ip: config.server.max_connections_per_ip,
            },
            session_config,
            handler,
        );

        // Background tasks
        let event_logger = self.events.spawn_logger();

        let drain_window = Duration::from_secs(config.drain_window_secs);
        let processor_task = {
            let processor = Arc::clone(&processor);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { processor.serve(shutdown, drain_window).await })
        };

        let cluster_task = cluster.as_ref().map(|coordinator| {
            let coordinator = Arc::clone(coordinator);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { coordinator.serve(shutdown).await })
        });

        let greylist_task = greylist.map(|greylist| {
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut sweep = tokio::time::interval(Duration::from_secs(600));
                loop {
                    tokio::select! {
                        _ = sweep.tick() => {
                            let purged = greylist.purge_expired();
                            if purged > 0 {
                                tracing::debug!(purged, "Greylist sweep");
                            }
                        }
                        sig = shutdown.recv() => {
                            if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                                return;
                            }
                        }
                    }
                }
            })
        });

        internal!(
            level = INFO,
            "Zetian serving on {}:{}",
            config.server.bind_address,
            config.server.port
        );

        // The listener is the foreground task; it returns when shutdown
        // has been broadcast and all sessions finished
        let result = listener.serve(self.shutdown.clone()).await;

        // Make sure everything else saw the signal even on listener
        // error
        let _ = self.shutdown.send(Signal::Shutdown);

        if let Err(e) = processor_task.await {
            tracing::error!("Dispatcher task panicked: {e}");
        }
        if let Some(task) = cluster_task {
            let _ = task.await;
        }
        if let Some(task) = greylist_task {
            let _ = task.await;
        }
        event_logger.abort();

        internal!(level = INFO, "Zetian stopped");
        result.map_err(Into::into)
    }
}
