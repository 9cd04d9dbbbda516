//! Test utilities for the broker test harness.
//!
//! This module provides infrastructure for testing without Docker:
//!
//! - [`MockHttpServer`] - A lightweight HTTP server recording every request
//! - [`MockMqttBroker`] - An in-process MQTT broker for messaging sessions
//! - [`FakeLauncher`] / [`ScriptedProbe`] - In-process launcher and readiness probe
//! - [`init_tracing`] - Installs the log subscriber once per process
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pubsub_harness::testing::{FakeLauncher, MockHttpServer, ScriptedProbe};
//! use pubsub_harness::{HarnessConfig, HarnessContext};
//!
//! #[tokio::test]
//! async fn test_rest_publish() {
//!     let mut server = MockHttpServer::new("127.0.0.1:0");
//!     let addr = server.start().await.unwrap();
//!
//!     let ctx = HarnessContext::with_launcher(
//!         HarnessConfig::default(),
//!         Arc::new(FakeLauncher::all_on("127.0.0.1", addr.port())),
//!         Arc::new(ScriptedProbe::always_ready()),
//!     )
//!     .await
//!     .unwrap();
//!
//!     let rest = ctx.connect_rest().await.unwrap();
//!     // ...
//! }
//! ```

pub mod fake_launcher;
pub mod mock_http;
pub mod mock_mqtt;

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

pub use fake_launcher::{FakeLauncher, ScriptedProbe};
pub use mock_http::{responses, MockHttpServer, MockResponse, RecordedRequest, ResponseGenerator};
pub use mock_mqtt::{MockMqttBroker, RecordedPublish};

static TRACING: Once = Once::new();

/// Install a tracing subscriber for tests.
///
/// Only the first call in a process has an effect; later calls (from other
/// tests) are ignored. `RUST_LOG` directives are honored on top of
/// `config.level`.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING.call_once(|| {
        let level = match config.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };

        let filter = EnvFilter::from_default_env().add_directive(level.into());
        let subscriber = tracing_subscriber::registry().with(filter);

        // Another subscriber may already be installed by the embedding test binary
        let _ = if config.json {
            subscriber
                .with(fmt::layer().json().with_test_writer())
                .try_init()
        } else {
            subscriber.with(fmt::layer().with_test_writer()).try_init()
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&LoggingConfig {
            level: "trace".to_string(),
            json: true,
        });
        tracing::info!("tracing initialized twice without panicking");
    }
}
