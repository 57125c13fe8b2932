//! End-to-end scenarios against a live in-process server.

mod support;

use std::time::Duration;

use support::harness::TestServer;
use zetian::ZetianConfig;
use zetian_common::Domain;
use zetian_filter::{Greylist, GreylistConfig, Pipeline, Thresholds};
use zetian_store::MessageStore;

fn local_config() -> ZetianConfig {
    let mut config = ZetianConfig::default();
    config.server.server_name = "mx.test.example".to_string();
    config.relay.local_domains = vec![Domain::new("local.example")];
    config
}

#[tokio::test]
async fn plain_send_to_local_domain_stays_out_of_the_queue() {
    let server = TestServer::start(local_config(), Pipeline::new(Thresholds::default())).await;
    let mut client = server.client().await;

    client.send("EHLO client.example").await;
    client.expect_code(250).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;
    client.send("RCPT TO:<u@local.example>").await;
    client.expect_code(250).await;
    client.send("DATA").await;
    client.expect_code(354).await;
    client
        .send_raw(b"Subject: hi\r\nTo: u@local.example\r\n\r\nbody\r\n.\r\n")
        .await;
    let reply = client.expect_code(250).await;
    assert!(reply.contains("Queued"));

    client.send("QUIT").await;
    client.expect_code(221).await;

    // No outbound queue entry exists for a purely local message
    let stats = server.queue.stats().await.unwrap();
    assert_eq!(stats.total_messages, 0);

    // The body is in the message store, tagged for the local mailbox,
    // with the original To header intact. The accept reply names the
    // envelope id, which doubles as the body handle.
    assert_eq!(server.store.len().await.unwrap(), 1);
    let envelope_id = reply
        .trim()
        .rsplit(' ')
        .next()
        .expect("id in accept reply")
        .to_string();
    let body_ref = zetian_common::BodyRef::new(envelope_id);

    let body = server.store.get(&body_ref).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("To: u@local.example"));

    let envelope = server.store.envelope(&body_ref).await.unwrap();
    assert_eq!(envelope.headers().get("to"), Some("u@local.example"));

    assert_eq!(
        server.store.local_recipients(&body_ref).await.unwrap(),
        vec!["u@local.example".to_string()]
    );
}

#[tokio::test]
async fn relay_denied_for_unauthenticated_external_recipient() {
    let server = TestServer::start(local_config(), Pipeline::new(Thresholds::default())).await;
    let mut client = server.client().await;

    client.send("EHLO client.example").await;
    client.expect_code(250).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.expect_code(250).await;

    client.send("RCPT TO:<u@external.example>").await;
    let reply = client.expect_code(550).await;
    assert!(reply.contains("relay denied"));
}

#[tokio::test]
async fn greylist_embargo_then_accept() {
    let greylist = Greylist::new(GreylistConfig {
        initial_delay: Duration::from_millis(150),
        max_retry_time: Duration::from_secs(60),
        whitelist_duration: Duration::from_secs(3600),
    });
    let pipeline =
        Pipeline::new(Thresholds::default()).with_greylist(std::sync::Arc::new(greylist));

    let server = TestServer::start(local_config(), pipeline).await;

    let send_message = |mut client: support::harness::TestClient| async move {
        client.send("EHLO client.example").await;
        client.expect_code(250).await;
        client.send("MAIL FROM:<a@x.example>").await;
        client.expect_code(250).await;
        client.send("RCPT TO:<u@local.example>").await;
        client.expect_code(250).await;
        client.send("DATA").await;
        client.expect_code(354).await;
        client.send_raw(b"Subject: grey\r\n\r\nbody\r\n.\r\n").await;
        client.expect_reply().await
    };

    // First sight: embargoed with a 451
    let (code, text) = send_message(server.client().await).await;
    assert_eq!(code, 451, "{text}");
    assert!(text.contains("greylisted"));

    // Retrying after the initial delay succeeds with the exact triplet
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (code, text) = send_message(server.client().await).await;
    assert_eq!(code, 250, "{text}");

    // The embargoed attempt persisted nothing; the accepted one did
    assert_eq!(server.store.len().await.unwrap(), 1);
}
