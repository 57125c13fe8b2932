//! The cluster coordinator: one per server instance.
//!
//! Owns the node map, the replicated session registry, and the state
//! KV. Heartbeats go to every Active peer on an interval; a sweep task
//! ages peers into Suspected and Failed, and the leader migrates the
//! sessions of failed owners. Leadership is the lowest node id among
//! Active nodes: deterministic, stable under steady state, re-evaluated
//! only when the incumbent stops being Active.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use uuid::Uuid;
use zetian_common::{internal, SessionRegistryRecord, Signal};

use crate::{
    config::{ClusterOptions, ConsistencyLevel},
    error::{ClusterError, Result},
    message::{self, AckPayload, Frame, Payload},
    node::{ClusterNode, NodeLoad, NodeState},
    transport,
};

/// Cluster-wide lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Forming,
    Healthy,
    NoQuorum,
    ShuttingDown,
}

/// Events surfaced to the embedding server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodeJoined(String),
    NodeSuspected(String),
    NodeFailed(String),
    NodeLeft(String),
    LeaderChanged(Option<String>),
    SessionMigrated {
        session_id: String,
        new_owner: String,
    },
    QuorumLost,
    QuorumRestored,
}

pub struct Coordinator {
    options: ClusterOptions,
    /// Peers by id; this node is not in the map.
    nodes: DashMap<String, ClusterNode>,
    /// Session registry: own sessions plus replicas held for peers.
    registry: DashMap<String, SessionRegistryRecord>,
    state_store: DashMap<String, Vec<u8>>,
    leader: RwLock<Option<String>>,
    cluster_state: RwLock<ClusterState>,
    load: RwLock<NodeLoad>,
    events: tokio::sync::broadcast::Sender<ClusterEvent>,
}

impl Coordinator {
    #[must_use]
    pub fn new(options: ClusterOptions) -> Arc<Self> {
        let (events, _) = tokio::sync::broadcast::channel(256);
        Arc::new(Self {
            options,
            nodes: DashMap::new(),
            registry: DashMap::new(),
            state_store: DashMap::new(),
            leader: RwLock::new(None),
            cluster_state: RwLock::new(ClusterState::Forming),
            load: RwLock::new(NodeLoad::default()),
            events,
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ClusterState {
        *self.cluster_state.read()
    }

    #[must_use]
    pub fn leader_node_id(&self) -> Option<String> {
        self.leader.read().clone()
    }

    /// Peers and their current states.
    #[must_use]
    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.nodes.iter().map(|n| n.clone()).collect()
    }

    /// Registry snapshot (own and replicated sessions).
    #[must_use]
    pub fn registry_snapshot(&self) -> Vec<SessionRegistryRecord> {
        self.registry.iter().map(|r| r.clone()).collect()
    }

    /// Update the load snapshot carried on heartbeats.
    pub fn set_load(&self, load: NodeLoad) {
        *self.load.write() = load;
    }

    /// Active known nodes, self included.
    fn active_count(&self) -> usize {
        1 + self
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Active)
            .count()
    }

    /// Total known nodes, self included.
    fn known_count(&self) -> usize {
        1 + self.nodes.len()
    }

    /// Majority of known cluster members are active.
    #[must_use]
    pub fn has_quorum(&self) -> bool {
        self.active_count() >= self.known_count() / 2 + 1
    }

    /// Run the coordinator until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        shutdown: tokio::sync::broadcast::Sender<Signal>,
    ) -> Result<()> {
        let listener = TcpListener::bind(self.options.bind).await?;
        let local = listener.local_addr()?;
        internal!(level = INFO, "Cluster node {} on {}", self.options.node_id, local);

        self.join_cluster().await;
        self.refresh_cluster_state();

        let mut heartbeat = tokio::time::interval(Duration::from_millis(
            self.options.heartbeat_interval_ms.max(10),
        ));
        let mut sweep = tokio::time::interval(Duration::from_millis(
            self.options.check_interval_ms.max(10),
        ));
        let mut receiver = shutdown.subscribe();

        loop {
            tokio::select! {
                sig = receiver.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        *self.cluster_state.write() = ClusterState::ShuttingDown;
                        self.announce_leave().await;
                        break;
                    }
                }

                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let coordinator = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = coordinator.serve_connection(stream).await {
                            tracing::debug!(peer = ?peer, "Cluster connection error: {e}");
                        }
                    });
                }

                _ = heartbeat.tick() => {
                    self.send_heartbeats().await;
                }

                _ = sweep.tick() => {
                    self.detect_failures().await;
                }
            }
        }

        Ok(())
    }

    async fn serve_connection(&self, mut stream: tokio::net::TcpStream) -> Result<()> {
        while let Some(frame) = message::read_frame(&mut stream).await? {
            tracing::trace!(
                kind = frame.payload.kind(),
                source = frame.source_node_id,
                "Cluster frame"
            );

            let wants_ack = frame.requires_ack;
            let ack = self.handle_frame(frame);
            if wants_ack {
                if let Some(ack) = ack {
                    let response = Frame {
                        message_id: Uuid::new_v4(),
                        source_node_id: self.options.node_id.clone(),
                        target_node_id: None,
                        payload: Payload::Ack(ack),
                        requires_ack: false,
                        ttl_secs: 60,
                    };
                    message::write_frame(&mut stream, &response).await?;
                }
            }
        }
        Ok(())
    }

    /// Dispatch one frame; returns the ack payload when one is due.
    fn handle_frame(&self, frame: Frame) -> Option<AckPayload> {
        let source = frame.source_node_id.clone();
        let message_id = frame.message_id;

        let ack = |success: bool, error: Option<String>, result: Option<Vec<u8>>| {
            Some(AckPayload {
                original_message_id: message_id,
                success,
                error,
                result,
            })
        };

        match frame.payload {
            Payload::Heartbeat { load, endpoint } => {
                self.observe_peer(&source, Some(endpoint), load);
                None
            }

            Payload::Join {
                endpoint,
                capabilities,
                ..
            } => {
                let mut node = ClusterNode::new(source.clone(), endpoint);
                node.capabilities = capabilities;
                let known = self.nodes.insert(source.clone(), node).is_some();
                if !known {
                    internal!(level = INFO, "Node {} joined the cluster", source);
                    let _ = self.events.send(ClusterEvent::NodeJoined(source));
                }
                self.refresh_cluster_state();

                // Answer with the roster: us plus everyone we know
                let mut roster = vec![ClusterNode::new(
                    self.options.node_id.clone(),
                    self.options.bind,
                )];
                roster.extend(self.nodes.iter().map(|n| n.clone()));
                let encoded = message::encode_roster(&roster).ok();
                ack(true, None, encoded)
            }

            Payload::Leave => {
                if self.nodes.remove(&source).is_some() {
                    internal!(level = INFO, "Node {} left the cluster", source);
                    let _ = self.events.send(ClusterEvent::NodeLeft(source.clone()));
                }
                self.registry
                    .retain(|_, record| record.owner_node_id != source);
                self.refresh_cluster_state();
                None
            }

            Payload::SessionReplicate(record) => {
                self.registry.insert(record.session_id.clone(), record);
                None
            }

            Payload::SessionRemove { session_id } => {
                self.registry.remove(&session_id);
                None
            }

            Payload::SessionMigrate { mut record, new_owner } => {
                let session_id = record.session_id.clone();
                record.owner_node_id.clone_from(&new_owner);
                self.registry.insert(session_id.clone(), record);
                let _ = self.events.send(ClusterEvent::SessionMigrated {
                    session_id,
                    new_owner,
                });
                ack(true, None, None)
            }

            Payload::StateReplicate { key, value } => {
                self.state_store.insert(key, value);
                ack(true, None, None)
            }

            Payload::ConfigurationUpdate { key, value } => {
                tracing::info!(key, value, "Configuration update from {source}");
                None
            }

            Payload::HealthCheck => ack(true, None, None),

            // Acks arrive on the sender's connection, not here
            Payload::Ack(_) => None,
        }
    }

    /// Record a heartbeat (or other sign of life) from a peer. Unknown
    /// senders become Active members.
    fn observe_peer(&self, id: &str, endpoint: Option<SocketAddr>, load: NodeLoad) {
        if id == self.options.node_id {
            return;
        }

        let mut known = true;
        {
            let mut entry = self.nodes.entry(id.to_string()).or_insert_with(|| {
                known = false;
                // Endpoint learned later from a Join; a placeholder that
                // cannot be routed to keeps the record honest
                ClusterNode::new(
                    id.to_string(),
                    endpoint.unwrap_or_else(|| "0.0.0.0:0".parse().expect("static addr")),
                )
            });

            let was_failed = matches!(entry.state, NodeState::Failed | NodeState::Suspected);
            entry.last_heartbeat_at = Utc::now();
            entry.load = load;
            entry.state = NodeState::Active;
            if let Some(endpoint) = endpoint {
                entry.endpoint = endpoint;
            }

            if was_failed {
                internal!(level = INFO, "Node {} recovered", id);
            }
        }

        if !known {
            internal!(level = INFO, "Discovered node {} via heartbeat", id);
            let _ = self.events.send(ClusterEvent::NodeJoined(id.to_string()));
        }

        self.refresh_cluster_state();
    }

    /// Contact the seed nodes; the first successful ack supplies the
    /// current roster.
    async fn join_cluster(&self) {
        let frame = Frame::new(
            self.options.node_id.clone(),
            Payload::Join {
                endpoint: self.options.bind,
                version: env!("CARGO_PKG_VERSION").to_string(),
                capabilities: self.options.capabilities.clone(),
            },
        )
        .with_ack();

        for seed in &self.options.seed_nodes {
            match transport::send(
                *seed,
                &frame,
                Duration::from_millis(self.options.send_timeout_ms),
            )
            .await
            {
                Ok(Some(ack)) if ack.success => {
                    if let Some(roster) = ack.result.as_deref().and_then(|bytes| {
                        message::decode_roster(bytes).ok()
                    }) {
                        for node in roster {
                            if node.id != self.options.node_id {
                                self.nodes.entry(node.id.clone()).or_insert(node);
                            }
                        }
                    }
                    internal!(level = INFO, "Joined cluster via seed {}", seed);
                    return;
                }
                Ok(_) => tracing::warn!("Seed {seed} refused our join"),
                Err(e) => tracing::debug!("Seed {seed} unreachable: {e}"),
            }
        }

        if !self.options.seed_nodes.is_empty() {
            tracing::warn!("No seed node reachable; forming a cluster of one");
        }
    }

    async fn announce_leave(&self) {
        let frame = Frame::new(self.options.node_id.clone(), Payload::Leave);
        for node in self.nodes.iter() {
            let _ = transport::send(
                node.endpoint,
                &frame,
                Duration::from_millis(self.options.send_timeout_ms),
            )
            .await;
        }
    }

    async fn send_heartbeats(&self) {
        let load = *self.load.read();
        let frame = Frame::new(
            self.options.node_id.clone(),
            Payload::Heartbeat {
                load,
                endpoint: self.options.bind,
            },
        );

        let targets: Vec<SocketAddr> = self
            .nodes
            .iter()
            .filter(|n| n.state != NodeState::Failed)
            .map(|n| n.endpoint)
            .collect();

        for endpoint in targets {
            let timeout = Duration::from_millis(self.options.send_timeout_ms);
            if let Err(e) = transport::send(endpoint, &frame, timeout).await {
                tracing::trace!("Heartbeat to {endpoint} failed: {e}");
            }
        }
    }

    /// Age peers into Suspected and Failed, then react to membership
    /// change: quorum, leadership, session migration.
    async fn detect_failures(&self) {
        let now = Utc::now();
        let threshold = self.options.failure_threshold_ms;
        let mut newly_failed: Vec<String> = Vec::new();

        for mut node in self.nodes.iter_mut() {
            let age = node.heartbeat_age_ms(now);
            match node.state {
                NodeState::Active if age > threshold => {
                    node.state = NodeState::Suspected;
                    tracing::warn!(node = node.id, age_ms = age, "Node suspected");
                    let _ = self.events.send(ClusterEvent::NodeSuspected(node.id.clone()));
                }
                NodeState::Suspected if age > threshold * 2 => {
                    node.state = NodeState::Failed;
                    tracing::warn!(node = node.id, age_ms = age, "Node failed");
                    let _ = self.events.send(ClusterEvent::NodeFailed(node.id.clone()));
                    newly_failed.push(node.id.clone());
                }
                _ => {}
            }
        }

        self.refresh_cluster_state();

        for failed in newly_failed {
            // The leader owns migration so two survivors do not race
            if self.leader_node_id().as_deref() == Some(self.node_id()) {
                self.migrate_sessions_from(&failed).await;
            }
        }
    }

    /// Recompute quorum and leadership after any membership change.
    fn refresh_cluster_state(&self) {
        let quorum = self.has_quorum();
        {
            let mut state = self.cluster_state.write();
            let next = match *state {
                ClusterState::ShuttingDown => ClusterState::ShuttingDown,
                _ if quorum => ClusterState::Healthy,
                _ => ClusterState::NoQuorum,
            };
            if *state != next {
                if next == ClusterState::NoQuorum {
                    tracing::warn!("Cluster lost quorum");
                    let _ = self.events.send(ClusterEvent::QuorumLost);
                } else if *state == ClusterState::NoQuorum {
                    internal!(level = INFO, "Cluster quorum restored");
                    let _ = self.events.send(ClusterEvent::QuorumRestored);
                }
                *state = next;
            }
        }

        // Leadership: the lowest id among Active nodes, self included.
        // Deterministic on every node, so independently formed nodes
        // converge on merge; unchanged while membership holds steady,
        // and a failed leader triggers a fresh election by dropping out
        // of the candidate set.
        let mut candidates: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Active)
            .map(|n| n.id.clone())
            .collect();
        candidates.push(self.options.node_id.clone());
        candidates.sort();
        let new_leader = candidates.into_iter().next();

        let mut leader = self.leader.write();
        if *leader != new_leader {
            internal!(level = INFO, "Leader changed to {:?}", new_leader);
            *leader = new_leader.clone();
            let _ = self.events.send(ClusterEvent::LeaderChanged(new_leader));
        }
    }

    /// Register a local session and replicate it to the
    /// `ReplicationFactor − 1` least-loaded active peers.
    pub async fn register_session(&self, record: SessionRegistryRecord) {
        self.registry
            .insert(record.session_id.clone(), record.clone());

        let replicas = self.options.replication_factor.saturating_sub(1);
        if replicas == 0 {
            return;
        }

        let frame = Frame::new(
            self.options.node_id.clone(),
            Payload::SessionReplicate(record),
        );

        for endpoint in self.least_loaded_peers(replicas) {
            let timeout = Duration::from_millis(self.options.send_timeout_ms);
            if let Err(e) = transport::send(endpoint, &frame, timeout).await {
                tracing::debug!("Session replication to {endpoint} failed: {e}");
            }
        }
    }

    /// Remove a finished session locally and on its replicas.
    pub async fn remove_session(&self, session_id: &str) {
        self.registry.remove(session_id);

        let frame = Frame::new(
            self.options.node_id.clone(),
            Payload::SessionRemove {
                session_id: session_id.to_string(),
            },
        );

        let targets: Vec<SocketAddr> = self
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Active)
            .map(|n| n.endpoint)
            .collect();
        for endpoint in targets {
            let timeout = Duration::from_millis(self.options.send_timeout_ms);
            let _ = transport::send(endpoint, &frame, timeout).await;
        }
    }

    /// Active peers sorted by fewest active sessions.
    fn least_loaded_peers(&self, count: usize) -> Vec<SocketAddr> {
        let mut peers: Vec<(u32, SocketAddr)> = self
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Active)
            .map(|n| (n.load.active_sessions, n.endpoint))
            .collect();
        peers.sort_by_key(|(sessions, _)| *sessions);
        peers.into_iter().take(count).map(|(_, e)| e).collect()
    }

    /// Reassign every replicated session owned by `failed_id` to a
    /// surviving active node.
    pub async fn migrate_sessions_from(&self, failed_id: &str) {
        let orphans: Vec<SessionRegistryRecord> = self
            .registry
            .iter()
            .filter(|r| r.owner_node_id == failed_id)
            .map(|r| r.clone())
            .collect();

        if orphans.is_empty() {
            return;
        }

        internal!(
            level = INFO,
            "Migrating {} sessions from failed node {}",
            orphans.len(),
            failed_id
        );

        // Survivors in rotation, ourselves included, so the orphaned
        // load spreads rather than piling on one node
        let mut survivors: Vec<Option<(String, SocketAddr)>> = self
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Active)
            .map(|n| Some((n.id.clone(), n.endpoint)))
            .collect();
        survivors.push(None); // None = adopt locally

        let mut reassigned: Vec<SessionRegistryRecord> = Vec::new();

        for (index, mut record) in orphans.into_iter().enumerate() {
            let target = &survivors[index % survivors.len()];

            let new_owner = match target {
                // Adopt locally
                None => self.options.node_id.clone(),
                Some((peer_id, endpoint)) => {
                    let frame = Frame::new(
                        self.options.node_id.clone(),
                        Payload::SessionMigrate {
                            record: record.clone(),
                            new_owner: peer_id.clone(),
                        },
                    )
                    .with_ack();

                    let timeout = Duration::from_millis(self.options.send_timeout_ms);
                    match transport::send(*endpoint, &frame, timeout).await {
                        Ok(Some(ack)) if ack.success => peer_id.clone(),
                        // Peer unreachable; adopt locally so the
                        // session is not orphaned
                        Ok(_) | Err(_) => self.options.node_id.clone(),
                    }
                }
            };

            record.owner_node_id.clone_from(&new_owner);
            self.registry
                .insert(record.session_id.clone(), record.clone());
            let _ = self.events.send(ClusterEvent::SessionMigrated {
                session_id: record.session_id.clone(),
                new_owner,
            });
            reassigned.push(record);
        }

        // Converge replica copies of the new ownership on every
        // survivor, so a later failover starts from accurate owners
        let peer_endpoints: Vec<SocketAddr> = survivors
            .iter()
            .filter_map(|s| s.as_ref().map(|(_, endpoint)| *endpoint))
            .collect();
        for endpoint in peer_endpoints {
            for record in &reassigned {
                let frame = Frame::new(
                    self.options.node_id.clone(),
                    Payload::SessionReplicate(record.clone()),
                );
                let timeout = Duration::from_millis(self.options.send_timeout_ms);
                let _ = transport::send(endpoint, &frame, timeout).await;
            }
        }
    }

    /// Replicate a state value at the requested consistency.
    ///
    /// The local write always happens; the call fails with a retryable
    /// error when the consistency level's ack requirement is not met.
    pub async fn replicate_state(
        &self,
        key: &str,
        value: Vec<u8>,
        level: ConsistencyLevel,
    ) -> Result<()> {
        self.state_store.insert(key.to_string(), value.clone());

        let replica_targets: Vec<SocketAddr> = self
            .least_loaded_peers(self.options.replication_factor.saturating_sub(1));

        let required = match level {
            ConsistencyLevel::One => 0,
            ConsistencyLevel::Quorum => self.options.quorum_acks(),
            ConsistencyLevel::All => replica_targets.len(),
        };

        if required == 0 {
            // Fire and forget to whatever replicas exist
            for endpoint in replica_targets {
                let frame = Frame::new(
                    self.options.node_id.clone(),
                    Payload::StateReplicate {
                        key: key.to_string(),
                        value: value.clone(),
                    },
                );
                let timeout = Duration::from_millis(self.options.send_timeout_ms);
                let _ = transport::send(endpoint, &frame, timeout).await;
            }
            return Ok(());
        }

        if replica_targets.len() < required {
            return Err(ClusterError::QuorumNotAvailable {
                acked: 0,
                required,
            });
        }

        let mut acked = 0usize;
        for endpoint in replica_targets {
            let frame = Frame::new(
                self.options.node_id.clone(),
                Payload::StateReplicate {
                    key: key.to_string(),
                    value: value.clone(),
                },
            )
            .with_ack();

            let timeout = Duration::from_millis(self.options.send_timeout_ms);
            match transport::send(endpoint, &frame, timeout).await {
                Ok(Some(ack)) if ack.success => acked += 1,
                Ok(_) | Err(_) => {}
            }
        }

        if acked >= required {
            Ok(())
        } else {
            Err(ClusterError::QuorumNotAvailable { acked, required })
        }
    }

    /// Local-first state read.
    #[must_use]
    pub fn get_state(&self, key: &str) -> Option<Vec<u8>> {
        self.state_store.get(key).map(|v| v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(id: &str) -> Arc<Coordinator> {
        Coordinator::new(ClusterOptions::new(id, "127.0.0.1:0".parse().unwrap()))
    }

    fn peer(id: &str, state: NodeState) -> ClusterNode {
        let mut node = ClusterNode::new(id, "127.0.0.1:7000".parse().unwrap());
        node.state = state;
        node
    }

    #[tokio::test]
    async fn quorum_counting() {
        let coordinator = coordinator("n1");
        // Alone: 1 of 1 known, majority
        assert!(coordinator.has_quorum());

        coordinator.nodes.insert("n2".into(), peer("n2", NodeState::Active));
        coordinator.nodes.insert("n3".into(), peer("n3", NodeState::Active));
        // 3 of 3
        assert!(coordinator.has_quorum());

        coordinator.nodes.get_mut("n3").unwrap().state = NodeState::Failed;
        // 2 of 3
        assert!(coordinator.has_quorum());

        coordinator.nodes.get_mut("n2").unwrap().state = NodeState::Failed;
        // 1 of 3
        assert!(!coordinator.has_quorum());
    }

    #[tokio::test]
    async fn leader_is_lowest_active_id() {
        let coordinator = coordinator("n2");
        coordinator.nodes.insert("n1".into(), peer("n1", NodeState::Active));
        coordinator.nodes.insert("n3".into(), peer("n3", NodeState::Active));

        coordinator.refresh_cluster_state();
        assert_eq!(coordinator.leader_node_id().as_deref(), Some("n1"));

        // Re-evaluation without membership change keeps the leader
        coordinator.refresh_cluster_state();
        assert_eq!(coordinator.leader_node_id().as_deref(), Some("n1"));

        // Leader fails: fresh election picks the lowest surviving id
        coordinator.nodes.get_mut("n1").unwrap().state = NodeState::Failed;
        coordinator.refresh_cluster_state();
        assert_eq!(coordinator.leader_node_id().as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_sender_adds_active_node() {
        let coordinator = coordinator("n1");
        let frame = Frame::new(
            "mystery",
            Payload::Heartbeat {
                load: NodeLoad::default(),
                endpoint: "127.0.0.1:7009".parse().unwrap(),
            },
        );
        coordinator.handle_frame(frame);

        let nodes = coordinator.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "mystery");
        assert_eq!(nodes[0].state, NodeState::Active);
    }

    #[tokio::test]
    async fn failure_detection_transitions() {
        let mut options = ClusterOptions::new("n1", "127.0.0.1:0".parse().unwrap());
        options.failure_threshold_ms = 10;
        let coordinator = Coordinator::new(options);

        let mut stale = peer("n2", NodeState::Active);
        stale.last_heartbeat_at = Utc::now() - chrono::Duration::milliseconds(15);
        coordinator.nodes.insert("n2".into(), stale);

        coordinator.detect_failures().await;
        assert_eq!(
            coordinator.nodes.get("n2").unwrap().state,
            NodeState::Suspected
        );

        coordinator.nodes.get_mut("n2").unwrap().last_heartbeat_at =
            Utc::now() - chrono::Duration::milliseconds(25);
        coordinator.detect_failures().await;
        assert_eq!(
            coordinator.nodes.get("n2").unwrap().state,
            NodeState::Failed
        );
    }

    #[tokio::test]
    async fn migration_with_no_peers_adopts_locally() {
        let coordinator = coordinator("n1");
        let record = SessionRegistryRecord {
            session_id: "s1".to_string(),
            owner_node_id: "dead".to_string(),
            remote_ip: "192.0.2.1".parse().unwrap(),
            started_at: Utc::now(),
            bytes_in: 0,
            bytes_out: 0,
            message_count: 0,
            affinity_key: None,
        };
        coordinator.registry.insert("s1".into(), record);

        coordinator.migrate_sessions_from("dead").await;

        let snapshot = coordinator.registry_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].owner_node_id, "n1");
    }

    #[tokio::test]
    async fn state_write_one_succeeds_alone() {
        let coordinator = coordinator("n1");
        coordinator
            .replicate_state("k", vec![1], ConsistencyLevel::One)
            .await
            .unwrap();
        assert_eq!(coordinator.get_state("k"), Some(vec![1]));
    }

    #[tokio::test]
    async fn state_write_quorum_fails_without_replicas() {
        let coordinator = coordinator("n1"); // replication_factor 2
        let err = coordinator
            .replicate_state("k", vec![1], ConsistencyLevel::Quorum)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        // The local write still happened; reads keep working
        assert_eq!(coordinator.get_state("k"), Some(vec![1]));
    }
}
