//! End-to-end scenarios over real loopback sockets (spec.md §8 "Concrete
//! scenarios" 1-4, 6). Scenario 5 (secure backend) lives in
//! `posttroll-transport`'s handshake and `Transport`-level tests.

use std::net::SocketAddr;
use std::time::Duration;

use posttroll_nameserver::{NameService, NameServiceOptions};
use posttroll_pubsub::{Publisher, PublisherOptions, Subscriber, SubscriberOptions};
use posttroll_types::{Config, Message, MessageData, MessageVersion};

async fn start_nameserver(no_multicast: bool) -> (NameService, SocketAddr) {
    let mut config = Config::default();
    config.nameserver_port = 0;
    let service = NameService::start(
        &config,
        NameServiceOptions { no_multicast, restrict_to_localhost: true, ..Default::default() },
    )
    .await
    .unwrap();
    let addr = service.local_addr();
    (service, addr)
}

/// Scenario 1: a publisher's message reaches a subscriber discovered
/// purely through the name service, within the 3s bound the scenario
/// names.
#[tokio::test]
async fn loopback_pub_sub_round_trip() {
    let (mut nameserver, ns_addr) = start_nameserver(false).await;

    let config = Config::default();
    let mut publisher = Publisher::start(
        PublisherOptions {
            name: "svc".to_string(),
            broadcast_interval: Duration::from_millis(30),
            nameservers: vec![ns_addr],
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();

    let mut subscriber = Subscriber::start(
        SubscriberOptions {
            services: vec!["svc".to_string()],
            nameserver: Some(ns_addr),
            addr_refresh_interval: Duration::from_millis(30),
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(subscriber.connected_count().await, 1);

    let message = Message::new("/counter", "info", Some(MessageData::Text("1".to_string())), None).unwrap();
    publisher.send(&message.encode()).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(3), subscriber.recv(None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.subject, "/counter");
    assert_eq!(got.type_, "info");
    assert_eq!(got.data, MessageData::Text("1".to_string()));

    subscriber.stop().await;
    publisher.stop().await;
    nameserver.stop().await;
}

/// Scenario 2: a subscriber asking for service `alpha` only hears from
/// the publisher named `alpha`, even though `beta` advertises to the
/// same nameserver.
#[tokio::test]
async fn service_name_filter_excludes_other_publishers() {
    let (mut nameserver, ns_addr) = start_nameserver(false).await;
    let config = Config::default();

    let mut alpha = Publisher::start(
        PublisherOptions {
            name: "alpha".to_string(),
            broadcast_interval: Duration::from_millis(30),
            nameservers: vec![ns_addr],
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();
    let mut beta = Publisher::start(
        PublisherOptions {
            name: "beta".to_string(),
            broadcast_interval: Duration::from_millis(30),
            nameservers: vec![ns_addr],
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();

    let mut subscriber = Subscriber::start(
        SubscriberOptions {
            services: vec!["alpha".to_string()],
            nameserver: Some(ns_addr),
            addr_refresh_interval: Duration::from_millis(30),
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(subscriber.connected_count().await, 1);

    beta.send(&Message::new("/from-beta", "info", None, None).unwrap().encode())
        .await
        .unwrap();
    alpha
        .send(&Message::new("/from-alpha", "info", None, None).unwrap().encode())
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_secs(3), subscriber.recv(None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.subject, "/from-alpha");

    subscriber.stop().await;
    alpha.stop().await;
    beta.stop().await;
    nameserver.stop().await;
}

/// Scenario 3: once a publisher disappears without a graceful stop (the
/// process-killed case), the nameserver's eviction sweep drops its
/// address and the subscriber's connection is closed.
#[tokio::test]
async fn eviction_after_publisher_disappears() {
    let mut config = Config::default();
    config.nameserver_port = 0;
    let mut nameserver = NameService::start(
        &config,
        NameServiceOptions {
            no_multicast: false,
            restrict_to_localhost: true,
            max_age: Duration::from_millis(100),
        },
    )
    .await
    .unwrap();
    let ns_addr = nameserver.local_addr();

    let publisher = Publisher::start(
        PublisherOptions {
            name: "svc".to_string(),
            broadcast_interval: Duration::from_millis(30),
            nameservers: vec![ns_addr],
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();

    let mut subscriber = Subscriber::start(
        SubscriberOptions {
            services: vec!["svc".to_string()],
            nameserver: Some(ns_addr),
            addr_refresh_interval: Duration::from_millis(30),
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(nameserver.receiver().get("svc").len(), 1);
    assert_eq!(subscriber.connected_count().await, 1);

    // Simulate the publisher process being killed: drop it without
    // calling `stop()`, so no graceful stop advertisement is sent.
    drop(publisher);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(nameserver.receiver().get("svc").len(), 0);
    assert_eq!(subscriber.connected_count().await, 0);

    subscriber.stop().await;
    nameserver.stop().await;
}

/// Scenario 4: with multicast disabled on both ends, a publisher that
/// pushes directly to the nameserver is still discoverable.
#[tokio::test]
async fn no_multicast_mode_still_discovers_publishers() {
    let (mut nameserver, ns_addr) = start_nameserver(true).await;
    let config = Config::default();

    let mut publisher = Publisher::start(
        PublisherOptions {
            name: "svc".to_string(),
            broadcast_interval: Duration::from_millis(30),
            nameservers: vec![ns_addr],
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();

    let mut subscriber = Subscriber::start(
        SubscriberOptions {
            services: vec!["svc".to_string()],
            nameserver: Some(ns_addr),
            addr_refresh_interval: Duration::from_millis(30),
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(subscriber.connected_count().await, 1);

    publisher
        .send(&Message::new("/counter", "info", None, None).unwrap().encode())
        .await
        .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(3), subscriber.recv(None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.subject, "/counter");

    subscriber.stop().await;
    publisher.stop().await;
    nameserver.stop().await;
}

/// Scenario 6: a publisher encoding under the legacy `v1.01` version is
/// readable by a subscriber that never configured a version (the
/// decoder is permissive regardless of the declared version).
#[tokio::test]
async fn v101_publisher_is_readable_without_any_special_subscriber_configuration() {
    let (mut nameserver, ns_addr) = start_nameserver(false).await;
    let mut config = Config::default();
    config.message_version = MessageVersion::V1_01;

    let mut publisher = Publisher::start(
        PublisherOptions {
            name: "svc".to_string(),
            broadcast_interval: Duration::from_millis(30),
            nameservers: vec![ns_addr],
            ..Default::default()
        },
        &config,
    )
    .await
    .unwrap();

    let subscriber_config = Config::default();
    let mut subscriber = Subscriber::start(
        SubscriberOptions {
            services: vec!["svc".to_string()],
            nameserver: Some(ns_addr),
            addr_refresh_interval: Duration::from_millis(30),
            ..Default::default()
        },
        &subscriber_config,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let message = Message::new(
        "/counter",
        "info",
        Some(MessageData::Text("1".to_string())),
        Some(MessageVersion::V1_01),
    )
    .unwrap();
    publisher.send(&message.encode()).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(3), subscriber.recv(None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.version, MessageVersion::V1_01);
    assert_eq!(got.data, MessageData::Text("1".to_string()));
    assert_eq!(got.time, message.time);

    subscriber.stop().await;
    publisher.stop().await;
    nameserver.stop().await;
}
