//! Management (SEMP) API client.
//!
//! Plain request/response over HTTP with basic authentication. Non-2xx
//! answers are returned to the caller, not turned into errors, so tests can
//! assert on authorization failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Method;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::config::{Credentials, HarnessConfig};
use crate::error::{HarnessError, Result};
use crate::instance::{LogicalPort, PortMap};
use crate::metrics::HarnessMetrics;

use super::{ProtocolSession, SessionState, StateCell};

const PROTOCOL: LogicalPort = LogicalPort::Management;

/// Base path of the configuration API.
pub const CONFIG_BASE_PATH: &str = "/SEMP/v2/config";

/// Message VPN listing, also used as the readiness endpoint.
pub const MSG_VPNS_PATH: &str = "/SEMP/v2/config/msgVpns";

/// A management API answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementResponse {
    pub status: u16,
    pub body: String,
}

impl ManagementResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Management`] if the body is not valid JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&self.body).map_err(|e| HarnessError::Management {
            status: self.status,
            message: format!("response body is not JSON: {e}"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct MsgVpnList {
    #[serde(default)]
    data: Vec<MsgVpnEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgVpnEntry {
    msg_vpn_name: String,
}

/// Connects management sessions.
#[derive(Debug, Clone)]
pub struct ManagementApiAdapter {
    connect_timeout: Duration,
    request_timeout: Duration,
    metrics: Option<Arc<HarnessMetrics>>,
}

impl ManagementApiAdapter {
    #[must_use]
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
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

    /// Open a session against `endpoint`, authenticating as `credentials`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Connection`] if the port does not accept a
    /// connection within the connect timeout.
    #[instrument(skip(self, credentials), fields(endpoint = %endpoint, username = %credentials.username))]
    pub async fn connect(
        &self,
        endpoint: &PortMap,
        credentials: &Credentials,
    ) -> Result<ManagementSession> {
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

        Ok(ManagementSession {
            client,
            endpoint: endpoint.clone(),
            credentials: credentials.clone(),
            request_timeout: self.request_timeout,
            state: StateCell::new(SessionState::Connected),
            metrics: self.metrics.clone(),
        })
    }
}

/// A management API session.
#[derive(Debug)]
pub struct ManagementSession {
    client: reqwest::Client,
    endpoint: PortMap,
    credentials: Credentials,
    request_timeout: Duration,
    state: StateCell,
    metrics: Option<Arc<HarnessMetrics>>,
}

impl ManagementSession {
    #[must_use]
    pub fn endpoint(&self) -> &PortMap {
        &self.endpoint
    }

    /// Send `method path` with the session credentials, or `credentials` if
    /// given.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::SessionClosed`] after close,
    /// [`HarnessError::Timeout`] if no answer arrives within the request
    /// timeout and [`HarnessError::Connection`] on transport failures.
    #[instrument(skip(self, method, credentials), fields(method = %method))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        credentials: Option<&Credentials>,
    ) -> Result<ManagementResponse> {
        if self.state.get() != SessionState::Connected {
            return Err(HarnessError::SessionClosed { protocol: PROTOCOL });
        }

        let credentials = credentials.unwrap_or(&self.credentials);
        let url = self.endpoint.http_url(path)?;
        let started = Instant::now();
        let result = self
            .client
            .request(method, url)
            .header(ACCEPT, "application/json")
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_duration(PROTOCOL, started.elapsed().as_secs_f64());
        }

        let response = result.map_err(|e| {
            if e.is_timeout() {
                HarnessError::Timeout {
                    what: format!("management request {path}"),
                    elapsed: self.request_timeout,
                }
            } else {
                HarnessError::Connection {
                    protocol: PROTOCOL,
                    address: self.endpoint.address(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| HarnessError::Management {
            status,
            message: format!("failed to read body: {e}"),
        })?;

        debug!(path, status, bytes = body.len(), "management response");
        Ok(ManagementResponse { status, body })
    }

    /// `GET` a path under the configuration API, e.g. `msgVpns/default`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get_config(&self, path: &str) -> Result<ManagementResponse> {
        let path = format!("{CONFIG_BASE_PATH}/{}", path.trim_start_matches('/'));
        self.request(Method::GET, &path, None).await
    }

    /// Names of all configured message VPNs.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Management`] unless the API answers `200`
    /// with a well-formed listing.
    pub async fn list_message_vpns(&self) -> Result<Vec<String>> {
        let response = self.request(Method::GET, MSG_VPNS_PATH, None).await?;
        if response.status != 200 {
            return Err(HarnessError::Management {
                status: response.status,
                message: format!("listing message VPNs answered {}", response.status),
            });
        }

        let list: MsgVpnList =
            serde_json::from_str(&response.body).map_err(|e| HarnessError::Management {
                status: response.status,
                message: format!("malformed message VPN listing: {e}"),
            })?;
        Ok(list.data.into_iter().map(|entry| entry.msg_vpn_name).collect())
    }
}

#[async_trait]
impl ProtocolSession for ManagementSession {
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
    }
}
