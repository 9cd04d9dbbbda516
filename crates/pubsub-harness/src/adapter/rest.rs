//! REST messaging ingress.
//!
//! Every publish is one `POST http://host:port/{topic}`; the broker turns the
//! request body into a message on `topic`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::{Credentials, HarnessConfig};
use crate::error::{HarnessError, Result};
use crate::instance::{LogicalPort, PortMap};
use crate::metrics::HarnessMetrics;

use super::topic;
use super::{
    Payload, ProtocolSession, PublishAck, PublishReceipt, Publisher, SessionState, StateCell,
};

const PROTOCOL: LogicalPort = LogicalPort::Rest;
const BINARY_CONTENT_TYPE: &str = "application/octet-stream";
const JSON: &str = "application/json";

/// Connects REST ingress sessions.
#[derive(Debug, Clone)]
pub struct RestIngressAdapter {
    content_type: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    metrics: Option<Arc<HarnessMetrics>>,
}

impl RestIngressAdapter {
    /// Adapter configured from `config`.
    #[must_use]
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            content_type: config.rest.content_type.clone(),
            connect_timeout: config.timeouts.connect(),
            request_timeout: config.timeouts.request(),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<HarnessMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Open a session against `endpoint`.
    ///
    /// Verifies the REST port accepts TCP connections.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Connection`] if the port does not accept a
    /// connection within the connect timeout.
    #[instrument(skip(self, credentials), fields(endpoint = %endpoint))]
    pub async fn connect(&self, endpoint: &PortMap, credentials: &Credentials) -> Result<RestSession> {
        let connection_error = |message: String| HarnessError::Connection {
            protocol: PROTOCOL,
            address: endpoint.address(),
            message,
        };

        match timeout(self.connect_timeout, TcpStream::connect(endpoint.address())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(connection_error(e.to_string())),
            Err(_) => {
                return Err(connection_error(format!(
                    "not accepting within {:?}",
                    self.connect_timeout
                )))
            }
        }

        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| connection_error(e.to_string()))?;

        if let Some(metrics) = &self.metrics {
            metrics.session_opened(PROTOCOL);
        }
        debug!("rest session opened");

        Ok(RestSession {
            client,
            endpoint: endpoint.clone(),
            credentials: credentials.clone(),
            content_type: self.content_type.clone(),
            request_timeout: self.request_timeout,
            state: StateCell::new(SessionState::Connected),
            next_id: AtomicU64::new(0),
            metrics: self.metrics.clone(),
        })
    }
}

/// A REST ingress session.
#[derive(Debug)]
pub struct RestSession {
    client: reqwest::Client,
    endpoint: PortMap,
    credentials: Credentials,
    content_type: String,
    request_timeout: Duration,
    state: StateCell,
    next_id: AtomicU64,
    metrics: Option<Arc<HarnessMetrics>>,
}

impl RestSession {
    #[must_use]
    pub fn endpoint(&self) -> &PortMap {
        &self.endpoint
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_publish_failure(PROTOCOL);
        }
    }
}

#[async_trait]
impl Publisher for RestSession {
    /// POST `payload` to `destination`.
    ///
    /// Completes when the broker answered; only 2xx counts as success.
    async fn publish(&self, destination: &str, payload: Payload) -> Result<PublishReceipt> {
        if self.state.get() != SessionState::Connected {
            return Err(HarnessError::SessionClosed { protocol: PROTOCOL });
        }

        let publish_error = |status: Option<u16>, message: String| HarnessError::Publish {
            destination: destination.to_string(),
            status,
            message,
        };
        topic::validate_topic(destination).map_err(|message| publish_error(None, message))?;

        let content_type = match payload.kind() {
            super::PayloadKind::Text => self.content_type.as_str(),
            super::PayloadKind::Binary => BINARY_CONTENT_TYPE,
        };
        let url = self.endpoint.http_url(destination)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();

        let result = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, JSON)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .body(payload.into_bytes())
            .send()
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_duration(PROTOCOL, started.elapsed().as_secs_f64());
        }

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                self.record_failure();
                return Err(HarnessError::Timeout {
                    what: format!("REST publish to '{destination}'"),
                    elapsed: self.request_timeout,
                });
            }
            Err(e) => {
                self.record_failure();
                return Err(publish_error(None, e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.record_failure();
            let body = response.text().await.unwrap_or_default();
            warn!(topic = destination, status = status.as_u16(), "REST publish rejected");
            return Err(publish_error(
                Some(status.as_u16()),
                format!("broker answered {status}: {body}"),
            ));
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_publish(PROTOCOL);
        }
        debug!(publish_id = id, topic = destination, status = status.as_u16(), "REST publish accepted");
        Ok(PublishReceipt::Acknowledged(PublishAck { id }))
    }
}

#[async_trait]
impl ProtocolSession for RestSession {
    fn protocol(&self) -> LogicalPort {
        PROTOCOL
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    async fn close(&self) {
        if self.state.close() == SessionState::Closed {
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.session_closed(PROTOCOL);
        }
        debug!(endpoint = %self.endpoint, "rest session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{responses, MockHttpServer};

    async fn session(server: &mut MockHttpServer) -> RestSession {
        let addr = server.start().await.unwrap();
        let endpoint = PortMap::new(LogicalPort::Rest, "127.0.0.1", addr.port());
        RestIngressAdapter::new(&HarnessConfig::default())
            .connect(&endpoint, &Credentials::default_client())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_posts_json_to_topic_path() {
        let mut server = MockHttpServer::new("127.0.0.1:0");
        let rest = session(&mut server).await;

        let receipt = rest
            .publish("http/topic", Payload::from(r#"{"hello": "world"}"#))
            .await
            .unwrap();
        assert!(matches!(receipt, PublishReceipt::Acknowledged(PublishAck { id: 1 })));

        let calls = server.get_calls_for_path("/http/topic").await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "POST");
        assert_eq!(calls[0].header("content-type"), Some("application/json"));
        assert_eq!(calls[0].header("accept"), Some("application/json"));
        assert_eq!(calls[0].body_text(), r#"{"hello": "world"}"#);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_reserved_characters_stay_in_topic_path() {
        let mut server = MockHttpServer::new("127.0.0.1:0");
        let rest = session(&mut server).await;

        rest.publish("orders/a?b/100%", Payload::from("x"))
            .await
            .unwrap();

        let calls = server.get_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, "/orders/a%3Fb/100%25");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_binary_payload_uses_octet_stream() {
        let mut server = MockHttpServer::new("127.0.0.1:0");
        let rest = session(&mut server).await;

        rest.publish("bin/topic", Payload::from(vec![0u8, 1, 2]))
            .await
            .unwrap();

        let calls = server.get_calls().await;
        assert_eq!(calls[0].header("content-type"), Some(BINARY_CONTENT_TYPE));
        assert_eq!(calls[0].body.as_ref(), &[0u8, 1, 2]);
    }

    #[tokio::test]
    async fn test_non_2xx_is_publish_error() {
        let mut server = MockHttpServer::new("127.0.0.1:0");
        server
            .register_handler("/http/topic", responses::fixed(400, "bad topic"))
            .await;
        let rest = session(&mut server).await;

        let err = rest
            .publish("http/topic", Payload::from("{}"))
            .await
            .unwrap_err();
        match err {
            HarnessError::Publish { status, message, .. } => {
                assert_eq!(status, Some(400));
                assert!(message.contains("bad topic"));
            }
            other => panic!("expected publish error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let mut server = MockHttpServer::new("127.0.0.1:0");
        let rest = session(&mut server).await;

        rest.close().await;
        rest.close().await;

        assert_eq!(rest.state(), SessionState::Closed);
        let err = rest.publish("http/topic", Payload::from("{}")).await.unwrap_err();
        assert!(matches!(err, HarnessError::SessionClosed { protocol: LogicalPort::Rest }));
        assert!(server.get_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = PortMap::new(LogicalPort::Rest, "127.0.0.1", port);
        let err = RestIngressAdapter::new(&HarnessConfig::default())
            .connect(&endpoint, &Credentials::default_client())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Connection { protocol: LogicalPort::Rest, .. }));
    }
}
