//! Harness context tests against in-process stand-ins.
//!
//! Every logical port of the fake instance points at one mock HTTP server,
//! so the REST ingress and management adapters run their real HTTP paths
//! without Docker.

use std::sync::Arc;

use pubsub_harness::adapter::management::MSG_VPNS_PATH;
use pubsub_harness::testing::{
    init_tracing, responses, FakeLauncher, MockHttpServer, ScriptedProbe,
};
use pubsub_harness::{
    Credentials, HarnessConfig, HarnessContext, HarnessError, LifecycleState, LogicalPort,
    Payload, ProtocolSession, PublishReceipt, Publisher, SessionState,
};

/// A started context whose ports all lead to `server`.
async fn context_on(server: &mut MockHttpServer) -> HarnessContext {
    init_tracing(&HarnessConfig::default().logging);
    let addr = server.start().await.unwrap();

    HarnessContext::with_launcher(
        HarnessConfig::default(),
        Arc::new(FakeLauncher::all_on("127.0.0.1", addr.port())),
        Arc::new(ScriptedProbe::always_ready()),
    )
    .await
    .unwrap()
}

// =============================================================================
// Endpoints and credentials
// =============================================================================

#[tokio::test]
async fn test_endpoints_are_stable_while_ready() {
    let mut server = MockHttpServer::new("127.0.0.1:0");
    let ctx = context_on(&mut server).await;

    for logical in LogicalPort::ALL {
        let first = ctx.endpoint(logical).unwrap();
        let second = ctx.endpoint(logical).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.host(), ctx.host().unwrap());
        assert_eq!(ctx.port_for(logical).unwrap(), first.port());
    }

    ctx.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_default_identities() {
    let mut server = MockHttpServer::new("127.0.0.1:0");
    let ctx = context_on(&mut server).await;

    assert_eq!(ctx.admin_credentials(), &Credentials::admin());
    assert_eq!(ctx.default_credentials(), &Credentials::default_client());
    assert_eq!(ctx.message_vpn(), "default");
    assert!(format!("{:?}", ctx.admin_credentials()).contains("<redacted>"));
}

// =============================================================================
// REST ingress
// =============================================================================

#[tokio::test]
async fn test_rest_publish_through_context() {
    let mut server = MockHttpServer::new("127.0.0.1:0");
    let ctx = context_on(&mut server).await;

    let rest = ctx.connect_rest().await.unwrap();
    let receipt = rest
        .publish("http/topic", Payload::from(r#"{"hello": "world"}"#))
        .await
        .unwrap();
    assert!(matches!(receipt, PublishReceipt::Acknowledged(_)));

    let calls = server.get_calls_for_path("/http/topic").await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].header("content-type"), Some("application/json"));
    assert_eq!(calls[0].body_text(), r#"{"hello": "world"}"#);

    let metrics = ctx.metrics().encode().unwrap();
    assert!(metrics.contains("pubsub_harness_publishes_total{protocol=\"rest\"} 1"));

    rest.close().await;
    assert_eq!(rest.state(), SessionState::Closed);
    assert_eq!(ctx.metrics().open_sessions(LogicalPort::Rest), 0);
}

#[tokio::test]
async fn test_rest_rejection_counts_failure() {
    let mut server = MockHttpServer::new("127.0.0.1:0");
    server
        .register_handler("/http/topic", responses::fixed(503, "spool full"))
        .await;
    let ctx = context_on(&mut server).await;

    let rest = ctx.connect_rest().await.unwrap();
    let err = rest
        .publish("http/topic", Payload::from("{}"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HarnessError::Publish {
            status: Some(503),
            ..
        }
    ));

    let metrics = ctx.metrics().encode().unwrap();
    assert!(metrics.contains("pubsub_harness_publish_failures_total{protocol=\"rest\"} 1"));
}

// =============================================================================
// Management API
// =============================================================================

#[tokio::test]
async fn test_management_lists_default_vpn() {
    let mut server = MockHttpServer::new("127.0.0.1:0");
    server
        .register_handler(
            MSG_VPNS_PATH,
            responses::require_basic_auth("admin", "admin", responses::msg_vpns(&["default"])),
        )
        .await;
    let ctx = context_on(&mut server).await;

    let management = ctx.connect_management().await.unwrap();
    let vpns = management.list_message_vpns().await.unwrap();
    assert!(vpns.iter().any(|vpn| vpn == ctx.message_vpn()));
}

#[tokio::test]
async fn test_management_credential_override() {
    let mut server = MockHttpServer::new("127.0.0.1:0");
    server
        .register_handler(
            MSG_VPNS_PATH,
            responses::require_basic_auth("admin", "admin", responses::msg_vpns(&["default"])),
        )
        .await;
    let ctx = context_on(&mut server).await;
    let management = ctx.connect_management().await.unwrap();

    let ok = management
        .request(reqwest::Method::GET, MSG_VPNS_PATH, None)
        .await
        .unwrap();
    assert_eq!(ok.status, 200);
    assert!(ok.body.contains("default"));

    let intruder = Credentials::new("admin", "not-the-password");
    let denied = management
        .request(reqwest::Method::GET, MSG_VPNS_PATH, Some(&intruder))
        .await
        .unwrap();
    assert!(denied.status == 401 || denied.status == 403);
}

// =============================================================================
// Lifecycle through the context
// =============================================================================

#[tokio::test]
async fn test_sessions_refused_after_shutdown() {
    let mut server = MockHttpServer::new("127.0.0.1:0");
    let ctx = context_on(&mut server).await;

    ctx.shutdown().await;
    assert_eq!(ctx.state(), LifecycleState::Stopped);

    assert!(matches!(
        ctx.connect_management().await,
        Err(HarnessError::InstanceNotReady {
            state: LifecycleState::Stopped
        })
    ));
    assert!(matches!(
        ctx.connect_messaging().await,
        Err(HarnessError::InstanceNotReady { .. })
    ));
}

#[tokio::test]
async fn test_slow_readiness_still_starts() {
    let mut config = HarnessConfig::default();
    config.instance.readiness_poll_interval_ms = 5;
    let probe = Arc::new(ScriptedProbe::ready_after(4));

    let ctx = HarnessContext::with_launcher(config, Arc::new(FakeLauncher::new()), probe.clone())
        .await
        .unwrap();

    assert_eq!(probe.checks(), 4);
    assert_eq!(ctx.state(), LifecycleState::Ready);
}
