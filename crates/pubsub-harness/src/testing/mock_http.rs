//! Mock HTTP endpoint for adapter tests.
//!
//! A lightweight HTTP/1.1 server that:
//! - Accepts connections on an ephemeral port
//! - Records every request received
//! - Returns configurable responses per path

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};

/// A recorded HTTP request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request method, upper case.
    pub method: String,
    /// Request path, without the query string.
    pub path: String,
    /// Headers with lower-case names.
    pub headers: BTreeMap<String, String>,
    /// Raw request body.
    pub body: Bytes,
}

impl RecordedRequest {
    /// Look up a header by name, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Decoded basic-auth `(username, password)`, if present.
    #[must_use]
    pub fn basic_auth(&self) -> Option<(String, String)> {
        let encoded = self.header("authorization")?.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }

    /// Body as UTF-8 text.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl MockResponse {
    /// `200 OK` with a JSON body.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::with_status(200, body)
    }

    /// A JSON response with the given status.
    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: body.into(),
        }
    }
}

/// Response generator function type.
pub type ResponseGenerator = Arc<dyn Fn(&RecordedRequest) -> MockResponse + Send + Sync>;

/// Mock HTTP server for testing.
pub struct MockHttpServer {
    address: String,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    call_log: Arc<RwLock<Vec<RecordedRequest>>>,
    response_handlers: Arc<RwLock<HashMap<String, ResponseGenerator>>>,
}

impl MockHttpServer {
    /// Create a new server that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            local_addr: None,
            shutdown_tx: None,
            call_log: Arc::new(RwLock::new(Vec::new())),
            response_handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start serving.
    ///
    /// Returns the actual address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.address).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let call_log = self.call_log.clone();
        let response_handlers = self.response_handlers.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        let call_log = call_log.clone();
                        let response_handlers = response_handlers.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                let call_log = call_log.clone();
                                let response_handlers = response_handlers.clone();
                                async move {
                                    Ok::<_, Infallible>(
                                        Self::respond(req, call_log, response_handlers).await,
                                    )
                                }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                tracing::debug!(error = %e, "mock http connection error");
                            }
                        });
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting connections.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Register a response handler for an exact request path.
    pub async fn register_handler(&self, path: &str, handler: ResponseGenerator) {
        self.response_handlers
            .write()
            .await
            .insert(path.to_string(), handler);
    }

    /// Get all recorded requests.
    pub async fn get_calls(&self) -> Vec<RecordedRequest> {
        self.call_log.read().await.clone()
    }

    /// Get requests recorded for `path`.
    pub async fn get_calls_for_path(&self, path: &str) -> Vec<RecordedRequest> {
        self.call_log
            .read()
            .await
            .iter()
            .filter(|c| c.path == path)
            .cloned()
            .collect()
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.call_log.write().await.clear();
    }

    /// The bound address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn respond(
        req: Request<hyper::body::Incoming>,
        call_log: Arc<RwLock<Vec<RecordedRequest>>>,
        response_handlers: Arc<RwLock<HashMap<String, ResponseGenerator>>>,
    ) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();

        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let call = RecordedRequest {
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            headers,
            body,
        };
        call_log.write().await.push(call.clone());

        let scripted = {
            let handlers = response_handlers.read().await;
            handlers.get(&call.path).map(|handler| handler(&call))
        };
        let scripted = scripted.unwrap_or_else(|| MockResponse::ok("{}"));

        let mut response = Response::new(Full::new(Bytes::from(scripted.body)));
        *response.status_mut() =
            StatusCode::from_u16(scripted.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if let Ok(value) = scripted.content_type.parse::<hyper::header::HeaderValue>() {
            response
                .headers_mut()
                .insert(hyper::header::CONTENT_TYPE, value);
        }
        response
    }
}

/// Common response generators.
pub mod responses {
    use super::{MockResponse, ResponseGenerator};
    use std::sync::Arc;

    /// Always answer with `status` and `body`.
    pub fn fixed(status: u16, body: &str) -> ResponseGenerator {
        let body = body.to_string();
        Arc::new(move |_| MockResponse::with_status(status, body.clone()))
    }

    /// A management API message-VPN listing with the given VPN names.
    pub fn msg_vpns(names: &[&str]) -> ResponseGenerator {
        let data: Vec<serde_json::Value> = names
            .iter()
            .map(|name| serde_json::json!({ "msgVpnName": name }))
            .collect();
        let body = serde_json::json!({
            "data": data,
            "meta": { "responseCode": 200 }
        })
        .to_string();
        Arc::new(move |_| MockResponse::ok(body.clone()))
    }

    /// `200` for the given basic-auth identity, `401` for anything else.
    pub fn require_basic_auth(
        username: &str,
        password: &str,
        inner: ResponseGenerator,
    ) -> ResponseGenerator {
        let expected = (username.to_string(), password.to_string());
        Arc::new(move |call| {
            if call.basic_auth().as_ref() == Some(&expected) {
                inner(call)
            } else {
                MockResponse::with_status(401, r#"{"meta":{"responseCode":401}}"#)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_requests_and_scripts_responses() {
        let mut server = MockHttpServer::new("127.0.0.1:0");
        let addr = server.start().await.unwrap();
        server
            .register_handler("/teapot", responses::fixed(418, "short and stout"))
            .await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/teapot"))
            .basic_auth("admin", Some("admin"))
            .body("tea")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 418);

        let calls = server.get_calls_for_path("/teapot").await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "POST");
        assert_eq!(calls[0].body_text(), "tea");
        assert_eq!(
            calls[0].basic_auth(),
            Some(("admin".to_string(), "admin".to_string()))
        );

        server.stop().await;
    }
}
