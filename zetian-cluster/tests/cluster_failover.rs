//! Three-node failover: the owner of replicated sessions stops
//! heartbeating, survivors detect the failure, and every session is
//! reassigned to an active node.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use zetian_cluster::{ClusterOptions, Coordinator, NodeState};
use zetian_common::{SessionRegistryRecord, Signal};

fn free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn options(node_id: &str, bind: SocketAddr, seeds: Vec<SocketAddr>) -> ClusterOptions {
    let mut options = ClusterOptions::new(node_id, bind);
    options.seed_nodes = seeds;
    options.replication_factor = 3;
    options.heartbeat_interval_ms = 50;
    options.failure_threshold_ms = 200;
    options.check_interval_ms = 50;
    options.send_timeout_ms = 1000;
    options
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, predicate: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn record(session_id: String, owner: &str) -> SessionRegistryRecord {
    SessionRegistryRecord {
        session_id,
        owner_node_id: owner.to_string(),
        remote_ip: "192.0.2.7".parse().unwrap(),
        started_at: Utc::now(),
        bytes_in: 100,
        bytes_out: 50,
        message_count: 1,
        affinity_key: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_migrate_off_a_failed_owner() {
    let addr_a = free_port();
    let addr_b = free_port();
    let addr_c = free_port();

    let node_a = Coordinator::new(options("node-a", addr_a, vec![]));
    let node_b = Coordinator::new(options("node-b", addr_b, vec![addr_a]));
    let node_c = Coordinator::new(options("node-c", addr_c, vec![addr_a]));

    let (shutdown, _) = tokio::sync::broadcast::channel::<Signal>(4);

    let serve_a = {
        let node = Arc::clone(&node_a);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { node.serve(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _serve_b = {
        let node = Arc::clone(&node_b);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { node.serve(shutdown).await })
    };
    let _serve_c = {
        let node = Arc::clone(&node_c);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { node.serve(shutdown).await })
    };

    // Full mesh: every node sees the other two as Active
    wait_until("full membership", Duration::from_secs(5), || {
        [&node_a, &node_b, &node_c].iter().all(|node| {
            let nodes = node.nodes();
            nodes.len() == 2 && nodes.iter().all(|n| n.state == NodeState::Active)
        })
    })
    .await;

    // 100 sessions owned by node-a, replicated to both survivors
    for i in 0..100 {
        node_a
            .register_session(record(format!("session-{i}"), "node-a"))
            .await;
    }

    wait_until("replicas on survivors", Duration::from_secs(5), || {
        node_b.registry_snapshot().len() == 100 && node_c.registry_snapshot().len() == 100
    })
    .await;

    // The owner goes dark
    serve_a.abort();

    wait_until("failure detection", Duration::from_secs(5), || {
        [&node_b, &node_c].iter().all(|node| {
            node.nodes()
                .iter()
                .any(|n| n.id == "node-a" && n.state == NodeState::Failed)
        })
    })
    .await;

    // Every session ends up with an active owner on the survivors
    wait_until("session migration", Duration::from_secs(5), || {
        [&node_b, &node_c].iter().all(|node| {
            let snapshot = node.registry_snapshot();
            snapshot.len() == 100
                && snapshot.iter().all(|r| {
                    r.owner_node_id == "node-b" || r.owner_node_id == "node-c"
                })
        })
    })
    .await;

    // One of the survivors leads
    let leader_b = node_b.leader_node_id();
    let leader_c = node_c.leader_node_id();
    assert_eq!(leader_b.as_deref(), Some("node-b"));
    assert_eq!(leader_c.as_deref(), Some("node-b"));
}
