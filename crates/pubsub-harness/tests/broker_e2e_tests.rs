//! End-to-end tests against a real broker container.
//!
//! All tests share one instance through `HarnessContext::shared()`.
//!
//! Run with: cargo test --test broker_e2e_tests -- --ignored

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pubsub_harness::adapter::management::MSG_VPNS_PATH;
use pubsub_harness::testing::init_tracing;
use pubsub_harness::{
    CorrelationSignal, Credentials, Delivery, DeliveryCollector, HarnessConfig, HarnessContext,
    LogicalPort, Payload, ProtocolSession, PublishAck, PublishEventHandler, PublishFailure,
    PublishReceipt, Publisher, SessionState,
};

const WAIT: Duration = Duration::from_secs(10);

async fn shared() -> anyhow::Result<&'static HarnessContext> {
    init_tracing(&HarnessConfig::default().logging);
    Ok(HarnessContext::shared().await?)
}

/// Records publish outcomes and signals once per outcome.
#[derive(Clone)]
struct AckRecorder {
    acks: Arc<Mutex<Vec<u64>>>,
    failures: Arc<Mutex<Vec<PublishFailure>>>,
    signal: CorrelationSignal,
}

impl AckRecorder {
    fn new(expected: usize) -> Self {
        Self {
            acks: Arc::default(),
            failures: Arc::default(),
            signal: CorrelationSignal::new(expected),
        }
    }
}

impl PublishEventHandler for AckRecorder {
    fn on_ack(&self, ack: PublishAck) {
        self.acks.lock().push(ack.id);
        self.signal.signal();
    }

    fn on_error(&self, failure: PublishFailure) {
        self.failures.lock().push(failure);
        self.signal.signal();
    }
}

// =============================================================================
// Messaging
// =============================================================================

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_publish_without_subscriber_is_acknowledged() -> anyhow::Result<()> {
    let ctx = shared().await?;
    let session = ctx.connect_messaging().await?;

    let recorder = AckRecorder::new(1);
    let publisher = session.publisher(recorder.clone());
    let receipt = publisher
        .publish("tutorial/topic", Payload::from("Hello world!"))
        .await?;

    let PublishReceipt::Sent { id } = receipt else {
        panic!("expected an asynchronous receipt, got {receipt:?}");
    };
    recorder.signal.expect(WAIT).await?;
    assert_eq!(*recorder.acks.lock(), vec![id]);
    assert!(recorder.failures.lock().is_empty());

    session.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_publish_subscribe_same_session() -> anyhow::Result<()> {
    let ctx = shared().await?;
    let session = ctx.connect_messaging().await?;

    let collector = DeliveryCollector::new(1);
    let subscription = session
        .subscribe("fire/forget", collector.clone())
        .await?;

    let publisher = session.publisher(pubsub_harness::LoggingPublishEvents);
    publisher
        .publish("fire/forget", Payload::from("Hello subscriber!"))
        .await?;

    let deliveries = collector.wait_for(WAIT).await?;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].topic, "fire/forget");
    assert_eq!(deliveries[0].payload.as_text(), Some("Hello subscriber!"));
    assert!(subscription.failures().is_empty());

    subscription.close().await;
    session.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_wildcard_subscription_across_sessions() -> anyhow::Result<()> {
    let ctx = shared().await?;
    let subscriber = ctx.connect_messaging().await?;
    let producer = ctx.connect_messaging().await?;

    let collector = DeliveryCollector::new(2);
    let _subscription = subscriber
        .subscribe("sensors/+/temp", collector.clone())
        .await?;

    let publisher = producer.publisher(pubsub_harness::LoggingPublishEvents);
    for room in ["kitchen", "garage"] {
        publisher
            .publish(&format!("sensors/{room}/temp"), Payload::from("21"))
            .await?;
    }

    let deliveries = collector.wait_for(WAIT).await?;
    let topics: Vec<_> = deliveries.iter().map(|d| d.topic.as_str()).collect();
    assert_eq!(topics, ["sensors/kitchen/temp", "sensors/garage/temp"]);

    producer.close().await;
    subscriber.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_callback_panic_is_recorded_and_signaled() -> anyhow::Result<()> {
    let ctx = shared().await?;
    let session = ctx.connect_messaging().await?;

    let signal = CorrelationSignal::one();
    let subscription = session
        .subscribe_with_signal(
            "panic/topic",
            |_: &Delivery| panic!("assertion inside callback"),
            signal.clone(),
        )
        .await?;

    session
        .publisher(pubsub_harness::LoggingPublishEvents)
        .publish("panic/topic", Payload::from("boom"))
        .await?;

    signal.expect(WAIT).await?;
    assert_eq!(subscription.failures(), vec!["assertion inside callback"]);
    assert_eq!(session.state(), SessionState::Connected);

    session.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_closed_subscription_gets_no_callbacks() -> anyhow::Result<()> {
    let ctx = shared().await?;
    let session = ctx.connect_messaging().await?;

    let closed = DeliveryCollector::new(1);
    let open = DeliveryCollector::new(1);
    let closed_subscription = session.subscribe("close/topic", closed.clone()).await?;
    let _open_subscription = session.subscribe("close/topic", open.clone()).await?;

    closed_subscription.close().await;
    closed_subscription.close().await;

    session
        .publisher(pubsub_harness::LoggingPublishEvents)
        .publish("close/topic", Payload::from("after close"))
        .await?;

    // The shared filter stays subscribed on the broker for the open subscription
    open.wait_for(WAIT).await?;
    assert!(closed.deliveries().is_empty());

    session.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_double_close_and_use_after_close() -> anyhow::Result<()> {
    let ctx = shared().await?;
    let session = ctx.connect_messaging().await?;
    let publisher = session.publisher(pubsub_harness::LoggingPublishEvents);

    session.close().await;
    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(publisher
        .publish("tutorial/topic", Payload::from("late"))
        .await
        .is_err());
    assert!(session
        .subscribe("tutorial/topic", |_: &Delivery| {})
        .await
        .is_err());
    Ok(())
}

// =============================================================================
// REST ingress
// =============================================================================

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_rest_publish_reaches_messaging_subscriber() -> anyhow::Result<()> {
    let ctx = shared().await?;
    let session = ctx.connect_messaging().await?;

    let collector = DeliveryCollector::new(1);
    let _subscription = session
        .subscribe("http/topic", collector.clone())
        .await?;

    let rest = ctx.connect_rest().await?;
    let receipt = rest
        .publish("http/topic", Payload::from(r#"{"hello": "world"}"#))
        .await?;
    assert!(matches!(receipt, PublishReceipt::Acknowledged(_)));

    let deliveries = collector.wait_for(WAIT).await?;
    assert_eq!(deliveries[0].topic, "http/topic");
    assert_eq!(
        deliveries[0].payload.as_text(),
        Some(r#"{"hello": "world"}"#)
    );

    rest.close().await;
    session.close().await;
    Ok(())
}

// =============================================================================
// Management API
// =============================================================================

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_management_lists_default_vpn() -> anyhow::Result<()> {
    let ctx = shared().await?;
    let management = ctx.connect_management().await?;

    let response = management
        .request(reqwest::Method::GET, MSG_VPNS_PATH, None)
        .await?;
    assert_eq!(response.status, 200);
    assert!(response.body.contains("default"));

    let vpns = management.list_message_vpns().await?;
    assert!(vpns.iter().any(|vpn| vpn == "default"));
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_management_rejects_wrong_password() -> anyhow::Result<()> {
    let ctx = shared().await?;
    let management = ctx.connect_management().await?;

    let wrong = Credentials::new(ctx.admin_credentials().username.clone(), "wrong");
    let response = management
        .request(reqwest::Method::GET, MSG_VPNS_PATH, Some(&wrong))
        .await?;
    assert!(
        response.status == 401 || response.status == 403,
        "unexpected status {}",
        response.status
    );
    Ok(())
}

// =============================================================================
// Provisioning
// =============================================================================

#[tokio::test]
#[ignore = "Requires Docker and the solace-pubsub-standard image"]
async fn test_ports_are_stable_and_distinct() -> anyhow::Result<()> {
    let ctx = shared().await?;

    let mut ports = Vec::new();
    for logical in LogicalPort::ALL {
        let port = ctx.port_for(logical)?;
        assert_eq!(ctx.port_for(logical)?, port);
        ports.push(port);
    }
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), LogicalPort::ALL.len());

    // Every published port accepts connections
    let host = ctx.host()?;
    for port in ports {
        tokio::net::TcpStream::connect((host, port)).await?;
    }
    Ok(())
}
