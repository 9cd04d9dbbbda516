//! Protocol adapters bound to the broker's logical ports.
//!
//! - [`messaging`]: publish/subscribe data plane with asynchronous callbacks
//! - [`rest`]: REST ingress, one synchronous POST per message
//! - [`management`]: request/response against the management API
//!
//! Every session implements [`ProtocolSession`]; sessions able to publish
//! also implement [`Publisher`].

pub mod management;
pub mod messaging;
pub mod rest;
pub mod topic;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::instance::LogicalPort;

pub use management::{ManagementApiAdapter, ManagementResponse, ManagementSession};
pub use messaging::{MessagePublisher, MessagingAdapter, MessagingOptions, MessagingSession, Subscription};
pub use rest::{RestIngressAdapter, RestSession};

/// Kind of a [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Binary,
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Binary(Bytes),
}

impl Payload {
    /// Decode a received body: valid UTF-8 becomes [`Payload::Text`].
    #[must_use]
    pub fn from_wire(bytes: Bytes) -> Self {
        match std::str::from_utf8(&bytes) {
            Ok(text) => Self::Text(text.to_owned()),
            Err(_) => Self::Binary(bytes),
        }
    }

    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Text(_) => PayloadKind::Text,
            Self::Binary(_) => PayloadKind::Binary,
        }
    }

    /// The text, if this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Raw body bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Convert into the bytes put on the wire.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::from(text),
            Self::Binary(bytes) => bytes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }
}

/// A message handed to a subscription callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Topic the message was published on.
    pub topic: String,
    /// Message body.
    pub payload: Payload,
    /// When the session received it.
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Broker acknowledgement of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    /// Session-scoped publish id.
    pub id: u64,
}

/// A publish that was not acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishFailure {
    /// Session-scoped publish id.
    pub id: u64,
    /// Human-readable cause.
    pub cause: String,
    /// When the failure was observed.
    pub timestamp: DateTime<Utc>,
}

impl PublishFailure {
    #[must_use]
    pub fn new(id: u64, cause: impl Into<String>) -> Self {
        Self {
            id,
            cause: cause.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of a successful publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReceipt {
    /// Handed to the transport; the acknowledgement arrives later.
    Sent { id: u64 },
    /// Acknowledged synchronously.
    Acknowledged(PublishAck),
}

impl PublishReceipt {
    /// Session-scoped publish id.
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Self::Sent { id } => *id,
            Self::Acknowledged(ack) => ack.id,
        }
    }
}

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// The connection was lost; the session cannot be used any more.
    Disconnected = 0,
    Connected = 1,
    /// Closed by the owner.
    Closed = 2,
}

/// Atomic cell holding a [`SessionState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            0 => SessionState::Disconnected,
            1 => SessionState::Connected,
            _ => SessionState::Closed,
        }
    }

    /// Move to `Closed`. Returns the previous state.
    pub(crate) fn close(&self) -> SessionState {
        let previous = self.0.swap(SessionState::Closed as u8, Ordering::AcqRel);
        match previous {
            0 => SessionState::Disconnected,
            1 => SessionState::Connected,
            _ => SessionState::Closed,
        }
    }

    /// Move from `Connected` to `Disconnected`; a closed session stays closed.
    pub(crate) fn disconnect(&self) -> bool {
        self.0
            .compare_exchange(
                SessionState::Connected as u8,
                SessionState::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Contract shared by every adapter session.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// The logical port this session is connected to.
    fn protocol(&self) -> LogicalPort;

    fn state(&self) -> SessionState;

    /// Release the session. Idempotent and infallible.
    async fn close(&self);
}

/// Sessions able to publish a payload to a destination.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` to `destination` (a topic).
    async fn publish(&self, destination: &str, payload: Payload) -> Result<PublishReceipt>;
}

/// Receives the asynchronous outcome of publishes.
///
/// Called on the session's delivery task; implementations must not block.
pub trait PublishEventHandler: Send + Sync + 'static {
    fn on_ack(&self, ack: PublishAck);
    fn on_error(&self, failure: PublishFailure);
}

/// Publish event handler that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublishEvents;

impl PublishEventHandler for LoggingPublishEvents {
    fn on_ack(&self, ack: PublishAck) {
        debug!(publish_id = ack.id, "publish acknowledged");
    }

    fn on_error(&self, failure: PublishFailure) {
        warn!(publish_id = failure.id, cause = %failure.cause, "publish failed");
    }
}

/// Receives messages for a subscription.
///
/// Called on the session's delivery task, never on the subscribing task.
/// Panics are caught and recorded on the subscription.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn on_message(&self, delivery: &Delivery);

    /// The session lost its connection; no more messages will arrive.
    fn on_error(&self, cause: &str) {
        let _ = cause;
    }
}

impl<F> DeliveryHandler for F
where
    F: Fn(&Delivery) + Send + Sync + 'static,
{
    fn on_message(&self, delivery: &Delivery) {
        self(delivery);
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
