//! Broker Integration Test Harness
//!
//! This library provisions one ephemeral message broker for a test run,
//! exposes its dynamically assigned endpoints, and lets a test publish on
//! one protocol and deterministically observe delivery on another before
//! asserting.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`instance`] - Broker container lifecycle and port discovery
//! - [`adapter`] - Messaging, REST ingress and management API sessions
//! - [`coordination`] - Correlation signals bridging callbacks to assertions
//! - [`context`] - The harness context tying it all together
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use pubsub_harness::{DeliveryCollector, HarnessContext, Payload, Publisher};
//!
//! let ctx = HarnessContext::shared().await?;
//! let session = ctx.connect_messaging().await?;
//!
//! let collector = DeliveryCollector::new(1);
//! let _subscription = session.subscribe("http/topic", collector.clone()).await?;
//!
//! let rest = ctx.connect_rest().await?;
//! rest.publish("http/topic", Payload::from(r#"{"hello": "world"}"#)).await?;
//!
//! let deliveries = collector.wait_for(Duration::from_secs(10)).await?;
//! assert_eq!(deliveries[0].payload.as_text(), Some(r#"{"hello": "world"}"#));
//! ```

#![deny(unsafe_code)]

pub mod adapter;
pub mod config;
pub mod context;
pub mod coordination;
pub mod error;
pub mod instance;
pub mod metrics;

/// Test utilities for testing without Docker.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use adapter::{
    Delivery, DeliveryHandler, LoggingPublishEvents, ManagementSession, MessagePublisher,
    MessagingSession, Payload, PayloadKind, ProtocolSession, PublishAck, PublishEventHandler,
    PublishFailure, PublishReceipt, Publisher, RestSession, SessionState, Subscription,
};
pub use config::{Credentials, HarnessConfig};
pub use context::HarnessContext;
pub use coordination::{CorrelationSignal, DeliveryCollector, WaitOutcome};
pub use error::{ConfigError, HarnessError, Result};
pub use instance::{LifecycleState, LogicalPort, PortMap};
pub use metrics::HarnessMetrics;
