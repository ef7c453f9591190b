//! End-to-end client behavior against the scripted mock broker
//!
//! Covers broker failover, protocol fallback, keepalive loss detection,
//! reconnect, QoS 1/2 flows with the durable store, routing and resume of
//! stored in-flight packets.


use mock_broker::{unused_url, MockBroker, Script};
use mqttlink::packet::{Packet, Publish};
use mqttlink::store::outbound_key;
use mqttlink::{
    handler, Client, ClientError, ClientOptions, ConnectReturnCode, ConnectionState, FileStore,
    LastWill, Message, ProtocolVersion, QoS, Store,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn options(brokers: &[&str]) -> ClientOptions {
    let mut options = ClientOptions::new()
        .client_id("integration")
        .connect_timeout(Duration::from_secs(2))
        .auto_reconnect(false);
    for broker in brokers {
        options = options.add_broker(*broker);
    }
    options
}

async fn connected(options: ClientOptions) -> Client {
    let client = Client::new(options).expect("valid options");
    let token = client.connect();
    assert!(token.wait_timeout(WAIT).await, "connect should complete");
    assert!(token.error().is_none(), "connect failed: {:?}", token.error());
    client
}

fn collecting_handler() -> (mqttlink::MessageHandler, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let on_message = handler(move |_client: &Client, message: &Message| {
        let _ = tx.send(message.clone());
    });
    (on_message, rx)
}

#[tokio::test]
async fn test_connect_fails_over_to_second_broker() {
    // Arrange
    let dead = unused_url().await;
    let broker = MockBroker::start(Script::default()).await;

    // Act
    let client = connected(options(&[&dead, &broker.url])).await;

    // Assert
    assert!(client.is_connected());
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(broker.connects().len(), 1);

    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_unreachable_brokers_report_network_error() {
    let first = unused_url().await;
    let second = unused_url().await;
    let client = Client::new(options(&[&first, &second])).unwrap();

    let token = client.connect();

    assert!(token.wait_timeout(WAIT).await);
    let error = token.error().expect("connect must fail");
    assert!(error.is_network(), "unexpected error: {error}");
    assert!(!error.is_rejection());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_unpinned_version_falls_back_to_31() {
    // Arrange: broker only speaks 3.1
    let broker = MockBroker::start(Script {
        accepted_levels: vec![3],
        ..Script::default()
    })
    .await;

    // Act
    let client = connected(options(&[&broker.url])).await;

    // Assert
    let levels: Vec<u8> = broker.connects().iter().map(|c| c.protocol.level()).collect();
    assert_eq!(levels, vec![4, 3]);
    assert_eq!(broker.connects()[1].protocol.protocol_name(), "MQIsdp");
    assert!(client.is_connected());

    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_pinned_version_does_not_fall_back() {
    // Arrange
    let broker = MockBroker::start(Script {
        accepted_levels: vec![3],
        ..Script::default()
    })
    .await;
    let client =
        Client::new(options(&[&broker.url]).protocol_version(ProtocolVersion::V311)).unwrap();

    // Act
    let token = client.connect();

    // Assert
    assert!(token.wait_timeout(WAIT).await);
    assert!(token.error().is_some_and(|e| e.is_rejection()));
    assert_eq!(
        token.return_code(),
        Some(ConnectReturnCode::UnacceptableProtocolVersion)
    );
    let levels: Vec<u8> = broker.connects().iter().map(|c| c.protocol.level()).collect();
    assert_eq!(levels, vec![4]);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_publish_while_disconnected_touches_no_socket() {
    let broker = MockBroker::start(Script::default()).await;
    let client = Client::new(options(&[&broker.url])).unwrap();

    let token = client.publish("a/b", QoS::AtLeastOnce, false, "payload");

    assert!(matches!(token.error(), Some(ClientError::NotConnected)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.received().is_empty());
}

#[tokio::test]
async fn test_connect_carries_credentials_and_will() {
    let broker = MockBroker::start(Script::default()).await;
    let will = LastWill::new("status/integration", "offline", QoS::AtLeastOnce, true);

    let client = connected(
        options(&[&broker.url])
            .credentials("user", "secret")
            .keep_alive(Duration::from_secs(45))
            .will(will.clone()),
    )
    .await;

    let connect = broker.connects().remove(0);
    assert_eq!(connect.client_id, "integration");
    assert_eq!(connect.username.as_deref(), Some("user"));
    assert_eq!(connect.password.as_deref(), Some(&b"secret"[..]));
    assert_eq!(connect.keep_alive, 45);
    assert_eq!(connect.will, Some(will));

    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_unanswered_ping_loses_connection_exactly_once() {
    // Arrange
    let broker = MockBroker::start(Script {
        answer_pings: false,
        ..Script::default()
    })
    .await;
    let lost = Arc::new(AtomicUsize::new(0));
    let seen = lost.clone();
    let client = connected(
        options(&[&broker.url])
            .keep_alive(Duration::from_secs(1))
            .on_connection_lost(Arc::new(move |_client: &Client, error: &ClientError| {
                assert!(matches!(error, ClientError::PingTimeout));
                seen.fetch_add(1, Ordering::SeqCst);
            })),
    )
    .await;

    // Act: one ping goes out, then several further checks find it unanswered
    tokio::time::sleep(Duration::from_millis(4500)).await;

    // Assert
    assert_eq!(lost.load(Ordering::SeqCst), 1);
    assert_eq!(broker.count("PINGREQ"), 1);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_answered_pings_keep_connection_alive() {
    let broker = MockBroker::start(Script::default()).await;
    let client = connected(options(&[&broker.url]).keep_alive(Duration::from_secs(1))).await;

    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert!(broker.count("PINGREQ") >= 2);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_reconnects_after_connection_drop() {
    // Arrange
    let broker = MockBroker::start(Script::default()).await;
    let connects = Arc::new(AtomicUsize::new(0));
    let losses = Arc::new(AtomicUsize::new(0));
    let (on_connect, on_lost) = (connects.clone(), losses.clone());
    let client = connected(
        options(&[&broker.url])
            .auto_reconnect(true)
            .max_reconnect_interval(Duration::from_secs(1))
            .on_connect(Arc::new(move |_client: &Client| {
                on_connect.fetch_add(1, Ordering::SeqCst);
            }))
            .on_connection_lost(Arc::new(move |_client: &Client, _error: &ClientError| {
                on_lost.fetch_add(1, Ordering::SeqCst);
            })),
    )
    .await;

    // Act
    broker.kick();

    // Assert
    assert!(
        broker
            .wait_for(
                |packets| packets.iter().filter(|p| p.name() == "CONNECT").count() == 2,
                WAIT
            )
            .await,
        "client should reconnect"
    );
    timeout(WAIT, async {
        while client.connection_state() != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client back to connected");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(losses.load(Ordering::SeqCst), 1);
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_qos1_round_trip_clears_store() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let broker = MockBroker::start(Script::default()).await;
    let client = connected(options(&[&broker.url]).store(store.clone())).await;
    let (on_message, mut messages) = collecting_handler();
    let subscribed = client.subscribe("echo/#", QoS::AtLeastOnce, Some(on_message));
    assert!(subscribed.wait_timeout(WAIT).await);
    assert_eq!(subscribed.granted_qos(), &[1]);

    // Act
    let token = client.publish("echo/one", QoS::AtLeastOnce, false, "hello");

    // Assert
    assert!(token.wait_timeout(WAIT).await);
    assert!(token.error().is_none());
    assert!(token.message_id().is_some());
    let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(message.topic, "echo/one");
    assert_eq!(message.payload_str(), "hello");
    assert_eq!(message.qos, QoS::AtLeastOnce);
    assert!(
        broker
            .wait_for(|packets| packets.iter().any(|p| p.name() == "PUBACK"), WAIT)
            .await,
        "client should acknowledge the echoed publication"
    );
    assert!(store.all().unwrap().is_empty());
    assert_eq!(client.in_flight(), 0);

    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_qos2_flows_complete_in_both_directions() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let broker = MockBroker::start(Script::default()).await;
    let client = connected(options(&[&broker.url]).store(store.clone())).await;
    let (on_message, mut messages) = collecting_handler();
    client
        .subscribe("exact/#", QoS::ExactlyOnce, Some(on_message))
        .wait_timeout(WAIT)
        .await;

    // Act
    let token = client.publish("exact/one", QoS::ExactlyOnce, false, vec![1u8, 2, 3]);

    // Assert: outbound PUBLISH, PUBREC, PUBREL, PUBCOMP
    assert!(token.wait_timeout(WAIT).await);
    assert!(token.error().is_none());
    let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(&message.payload[..], &[1, 2, 3]);
    // inbound PUBLISH, PUBREC, PUBREL, PUBCOMP
    assert!(
        broker
            .wait_for(
                |packets| packets.iter().any(|p| p.name() == "PUBCOMP")
                    && packets.iter().any(|p| p.name() == "PUBREL"),
                WAIT
            )
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.all().unwrap().is_empty());

    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_rejected_filter_fails_subscribe_token() {
    let broker = MockBroker::start(Script::default()).await;
    let client = connected(options(&[&broker.url])).await;

    let token = client.subscribe_multiple(
        &[("ok/#", QoS::AtMostOnce), ("reject/this", QoS::AtLeastOnce)],
        None,
    );

    assert!(token.wait_timeout(WAIT).await);
    assert!(matches!(
        token.error(),
        Some(ClientError::SubscriptionRejected { filter }) if filter == "reject/this"
    ));
    assert_eq!(token.granted_qos(), &[0, 0x80]);

    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_unsubscribed_handler_no_longer_receives() {
    // Arrange
    let broker = MockBroker::start(Script::default()).await;
    let (fallback, mut unrouted) = collecting_handler();
    let client = connected(options(&[&broker.url]).default_handler(fallback)).await;
    let (on_message, mut routed) = collecting_handler();
    client
        .subscribe("room/+", QoS::AtMostOnce, Some(on_message))
        .wait_timeout(WAIT)
        .await;

    client.publish("room/a", QoS::AtMostOnce, false, "before");
    let before = timeout(WAIT, routed.recv()).await.unwrap().unwrap();
    assert_eq!(before.payload_str(), "before");

    // Act
    let token = client.unsubscribe(&["room/+"]);
    assert!(token.wait_timeout(WAIT).await);
    client.publish("room/a", QoS::AtMostOnce, false, "after");

    // Assert: the echo falls through to the default handler only
    let after = timeout(WAIT, unrouted.recv()).await.unwrap().unwrap();
    assert_eq!(after.payload_str(), "after");
    assert!(routed.try_recv().is_err());
    assert!(client.routes().is_empty());

    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_resume_replays_stored_packets_with_dup() {
    // Arrange: an unacknowledged QoS 1 publication left by a previous run
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    store.open().unwrap();
    let mut stored = Publish::new("resume/me", QoS::AtLeastOnce, false, &b"pending"[..]);
    stored.message_id = 7;
    store.put(&outbound_key(7), &Packet::Publish(stored)).unwrap();
    store.close();
    let broker = MockBroker::start(Script {
        echo: false,
        ..Script::default()
    })
    .await;

    // Act
    let client = connected(
        options(&[&broker.url])
            .clean_session(false)
            .store(store.clone()),
    )
    .await;

    // Assert
    assert!(
        broker
            .wait_for(
                |packets| packets.iter().any(|p| matches!(
                    p,
                    Packet::Publish(publish) if publish.message_id == 7 && publish.dup
                )),
                WAIT
            )
            .await,
        "stored publication should be resent with DUP"
    );
    timeout(WAIT, async {
        while client.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replayed publication acknowledged");
    assert!(store.all().unwrap().is_empty());

    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_clean_session_discards_stored_packets() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    store.open().unwrap();
    store
        .put(&outbound_key(3), &Packet::PubRel { message_id: 3 })
        .unwrap();
    store.close();
    let broker = MockBroker::start(Script::default()).await;

    let client = connected(options(&[&broker.url]).store(store.clone())).await;

    assert!(store.all().unwrap().is_empty());
    assert_eq!(broker.count("PUBREL"), 0);
    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_disconnect_sends_disconnect_and_rejects_further_work() {
    // Arrange
    let broker = MockBroker::start(Script::default()).await;
    let client = connected(options(&[&broker.url])).await;

    // Act
    client.disconnect(Duration::from_secs(1)).await;

    // Assert
    assert!(
        broker
            .wait_for(|packets| packets.iter().any(|p| p.name() == "DISCONNECT"), WAIT)
            .await
    );
    assert!(!client.is_connected());
    let token = client.subscribe("a/#", QoS::AtMostOnce, None);
    assert!(matches!(token.error(), Some(ClientError::NotConnected)));
}

#[tokio::test]
async fn test_force_disconnect_skips_disconnect_packet() {
    let broker = MockBroker::start(Script::default()).await;
    let client = connected(options(&[&broker.url])).await;

    client.force_disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.count("DISCONNECT"), 0);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_client_can_connect_again_after_disconnect() {
    let broker = MockBroker::start(Script::default()).await;
    let client = connected(options(&[&broker.url])).await;
    client.disconnect(Duration::from_millis(500)).await;

    let token = client.connect();

    assert!(token.wait_timeout(WAIT).await);
    assert!(token.error().is_none());
    assert!(client.is_connected());
    assert_eq!(broker.connects().len(), 2);
    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_abandoned_handshake_does_not_take_over_new_connect() {
    // Arrange
    let broker = MockBroker::start(Script {
        connack_delay: Duration::from_millis(500),
        ..Script::default()
    })
    .await;
    let client = Client::new(options(&[&broker.url])).expect("valid options");

    // Act
    let first = client.connect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.disconnect(Duration::from_millis(50)).await;
    let second = client.connect();

    // Assert
    assert!(first.wait_timeout(WAIT).await);
    assert!(second.wait_timeout(WAIT).await);
    assert!(matches!(first.error(), Some(ClientError::NotConnected)));
    assert!(second.error().is_none(), "live connect failed: {:?}", second.error());
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    client.disconnect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_teardown_resolves_qos0_publish_stuck_in_write() {
    // Arrange: the broker stops reading after CONNACK
    let broker = MockBroker::start(Script {
        read_after_connect: false,
        ..Script::default()
    })
    .await;
    let client = connected(options(&[&broker.url])).await;
    let token = client.publish("bulk/data", QoS::AtMostOnce, false, vec![0u8; 64 << 20]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Act
    client.force_disconnect().await;

    // Assert
    assert!(
        token.wait_timeout(Duration::from_secs(3)).await,
        "QoS 0 token should resolve once the connection is torn down"
    );
    assert!(token.error().is_some());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}
