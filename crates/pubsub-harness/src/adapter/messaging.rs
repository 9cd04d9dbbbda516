//! Publish/subscribe data plane.
//!
//! Spoken over MQTT 3.1.1 against the broker's MQTT port; the broker shares
//! one topic space across protocols, so messages published here reach REST
//! and native subscribers and vice versa.
//!
//! Each session owns one delivery task driving the MQTT event loop. Every
//! callback (deliveries and publish outcomes) runs on that task. Requests
//! are written to the client under an ordering lock so that the packet ids
//! reported by the event loop can be matched, in order, to harness ids.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::{Credentials, HarnessConfig};
use crate::coordination::CorrelationSignal;
use crate::error::{HarnessError, Result};
use crate::instance::{LogicalPort, PortMap};
use crate::metrics::HarnessMetrics;

use super::topic;
use super::{
    Delivery, DeliveryHandler, Payload, ProtocolSession, PublishAck, PublishEventHandler,
    PublishFailure, PublishReceipt, Publisher, SessionState, StateCell,
};

const PROTOCOL: LogicalPort = LogicalPort::Mqtt;

/// Options of the messaging adapter.
#[derive(Debug, Clone)]
pub struct MessagingOptions {
    /// Prefix of generated client ids.
    pub client_id_prefix: String,
    /// Message VPN the session is expected to land in.
    pub message_vpn: String,
    /// Publish and subscribe QoS (0 or 1).
    pub qos: u8,
    pub keep_alive: Duration,
    /// Capacity of the request channel into the event loop.
    pub channel_capacity: usize,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub close_timeout: Duration,
}

impl MessagingOptions {
    /// Options described by `config`.
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            client_id_prefix: config.messaging.client_id_prefix.clone(),
            message_vpn: config.credentials.message_vpn.clone(),
            qos: config.messaging.qos,
            keep_alive: Duration::from_secs(config.messaging.keep_alive_secs),
            channel_capacity: config.messaging.channel_capacity,
            connect_timeout: config.timeouts.connect(),
            subscribe_timeout: config.timeouts.subscribe(),
            close_timeout: config.timeouts.close(),
        }
    }

    fn qos(&self) -> QoS {
        if self.qos == 0 {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        }
    }

    fn client_id(&self) -> String {
        format!("{}-{:08x}", self.client_id_prefix, rand::random::<u32>())
    }
}

impl Default for MessagingOptions {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

/// Connects messaging sessions.
#[derive(Debug, Clone, Default)]
pub struct MessagingAdapter {
    options: MessagingOptions,
    metrics: Option<Arc<HarnessMetrics>>,
}

impl MessagingAdapter {
    #[must_use]
    pub fn new(options: MessagingOptions) -> Self {
        Self {
            options,
            metrics: None,
        }
    }

    /// Record session activity in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<HarnessMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn options(&self) -> &MessagingOptions {
        &self.options
    }

    /// Connect to `endpoint` as `credentials`.
    ///
    /// Returns once the broker accepted the connection.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Connection`] if the broker refuses the
    /// connection or does not answer within the connect timeout.
    #[instrument(skip(self, credentials), fields(endpoint = %endpoint, username = %credentials.username))]
    pub async fn connect(
        &self,
        endpoint: &PortMap,
        credentials: &Credentials,
    ) -> Result<MessagingSession> {
        let client_id = self.options.client_id();
        let mut mqtt = MqttOptions::new(&client_id, endpoint.host(), endpoint.port());
        mqtt.set_keep_alive(self.options.keep_alive);
        mqtt.set_clean_session(true);
        mqtt.set_credentials(credentials.username.clone(), credentials.password.clone());

        let (client, mut eventloop) = AsyncClient::new(mqtt, self.options.channel_capacity);

        let connection_error = |message: String| HarnessError::Connection {
            protocol: PROTOCOL,
            address: endpoint.address(),
            message,
        };

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
        };
        match timeout(self.options.connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(connection_error(e.to_string())),
            Err(_) => {
                return Err(connection_error(format!(
                    "no CONNACK within {:?}",
                    self.options.connect_timeout
                )))
            }
        }

        let shared = Arc::new(Shared {
            client,
            address: endpoint.address(),
            state: StateCell::new(SessionState::Connected),
            qos: self.options.qos(),
            subscribe_timeout: self.options.subscribe_timeout,
            next_publish_id: AtomicU64::new(0),
            next_subscription_id: AtomicU64::new(0),
            request_order: tokio::sync::Mutex::new(()),
            pending_publishes: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            pending_subscribes: Mutex::new(VecDeque::new()),
            awaiting_suback: DashMap::new(),
            subscriptions: DashMap::new(),
            metrics: self.metrics.clone(),
        });

        let dispatcher = Dispatcher {
            shared: Arc::clone(&shared),
            eventloop,
        };
        let task = tokio::spawn(dispatcher.run());

        if let Some(metrics) = &self.metrics {
            metrics.session_opened(PROTOCOL);
        }
        info!(client_id = %client_id, vpn = %self.options.message_vpn, "messaging session connected");

        Ok(MessagingSession {
            shared,
            task: Mutex::new(Some(task)),
            endpoint: endpoint.clone(),
            client_id,
            close_timeout: self.options.close_timeout,
        })
    }
}

type SubAckSender = oneshot::Sender<std::result::Result<(), String>>;

/// A publish waiting for its transport handoff or its broker ack.
struct PendingPublish {
    id: u64,
    events: Arc<dyn PublishEventHandler>,
}

struct SubscriptionEntry {
    id: u64,
    filter: String,
    handler: Arc<dyn DeliveryHandler>,
    signal: Option<CorrelationSignal>,
    active: AtomicBool,
    /// Held for reading while a callback runs; taken for writing to deactivate.
    gate: RwLock<()>,
    failures: Mutex<Vec<String>>,
    delivered: AtomicU64,
}

impl SubscriptionEntry {
    /// Stop callbacks, waiting for a running one to finish.
    ///
    /// Returns whether this call deactivated the entry.
    async fn deactivate(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        drop(self.gate.write().await);
        true
    }
}

/// State shared between a session, its handles and its delivery task.
struct Shared {
    client: AsyncClient,
    address: String,
    state: StateCell,
    qos: QoS,
    subscribe_timeout: Duration,
    next_publish_id: AtomicU64,
    next_subscription_id: AtomicU64,
    request_order: tokio::sync::Mutex<()>,
    pending_publishes: Mutex<VecDeque<PendingPublish>>,
    in_flight: DashMap<u16, PendingPublish>,
    pending_subscribes: Mutex<VecDeque<SubAckSender>>,
    awaiting_suback: DashMap<u16, SubAckSender>,
    subscriptions: DashMap<u64, Arc<SubscriptionEntry>>,
    metrics: Option<Arc<HarnessMetrics>>,
}

impl Shared {
    fn ensure_connected(&self) -> Result<()> {
        match self.state.get() {
            SessionState::Connected => Ok(()),
            SessionState::Closed => Err(HarnessError::SessionClosed { protocol: PROTOCOL }),
            SessionState::Disconnected => Err(HarnessError::Connection {
                protocol: PROTOCOL,
                address: self.address.clone(),
                message: "connection lost".to_string(),
            }),
        }
    }

    /// Whether an active subscription still uses `filter`.
    fn filter_in_use(&self, filter: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|entry| entry.filter == filter && entry.active.load(Ordering::Acquire))
    }

    /// Fail every publish and subscribe still waiting on the broker.
    fn fail_outstanding(&self, cause: &str) {
        let mut failed: Vec<PendingPublish> = self.pending_publishes.lock().drain(..).collect();
        let keys: Vec<u16> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.in_flight.remove(&key) {
                failed.push(pending);
            }
        }
        failed.sort_by_key(|pending| pending.id);

        for pending in failed {
            if let Some(metrics) = &self.metrics {
                metrics.record_publish_failure(PROTOCOL);
            }
            let failure = PublishFailure::new(pending.id, cause);
            guarded("publish error", || pending.events.on_error(failure));
        }

        for sender in self.pending_subscribes.lock().drain(..) {
            let _ = sender.send(Err(cause.to_string()));
        }
        let keys: Vec<u16> = self.awaiting_suback.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, sender)) = self.awaiting_suback.remove(&key) {
                let _ = sender.send(Err(cause.to_string()));
            }
        }
    }
}

/// Run a user callback, catching a panic.
///
/// Returns the panic message if it panicked.
fn guarded(callback: &str, f: impl FnOnce()) -> Option<String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(panic) => {
            let message = panic_message(&*panic);
            warn!(callback, panic = %message, "callback panicked");
            Some(message)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Drives the event loop of one session.
struct Dispatcher {
    shared: Arc<Shared>,
    eventloop: EventLoop,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // Borrows only the shared state; EventLoop is not Sync
                    Self::deliver(&self.shared, publish.topic, publish.payload).await;
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => self.acknowledge(ack.pkid),
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    self.complete_subscribe(ack.pkid, &ack.return_codes);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.handed_off(pkid),
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => self.subscribe_sent(pkid),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    self.connection_lost(&e);
                    break;
                }
            }
        }
        self.shared
            .fail_outstanding("session closed before acknowledgement");
    }

    async fn deliver(shared: &Shared, topic: String, payload: Bytes) {
        let delivery = Delivery::new(topic, Payload::from_wire(payload));

        let mut entries: Vec<Arc<SubscriptionEntry>> = shared
            .subscriptions
            .iter()
            .filter(|entry| topic::matches(&entry.filter, &delivery.topic))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        entries.sort_by_key(|entry| entry.id);

        if entries.is_empty() {
            debug!(topic = %delivery.topic, "message matched no subscription");
        }

        for entry in entries {
            let _running = entry.gate.read().await;
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }

            match guarded("delivery", || entry.handler.on_message(&delivery)) {
                None => {
                    entry.delivered.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &shared.metrics {
                        metrics.record_delivery(PROTOCOL);
                    }
                }
                Some(message) => {
                    entry.failures.lock().push(message);
                    if let Some(metrics) = &shared.metrics {
                        metrics.record_callback_panic();
                    }
                }
            }

            if let Some(signal) = &entry.signal {
                signal.signal();
            }
        }
    }

    fn handed_off(&self, pkid: u16) {
        let Some(pending) = self.shared.pending_publishes.lock().pop_front() else {
            debug!(pkid, "untracked publish sent");
            return;
        };

        if self.shared.qos == QoS::AtMostOnce {
            let ack = PublishAck { id: pending.id };
            guarded("publish ack", || pending.events.on_ack(ack));
        } else {
            self.shared.in_flight.insert(pkid, pending);
        }
    }

    fn acknowledge(&self, pkid: u16) {
        if let Some((_, pending)) = self.shared.in_flight.remove(&pkid) {
            let ack = PublishAck { id: pending.id };
            guarded("publish ack", || pending.events.on_ack(ack));
        } else {
            debug!(pkid, "ack for unknown publish");
        }
    }

    fn subscribe_sent(&self, pkid: u16) {
        if let Some(sender) = self.shared.pending_subscribes.lock().pop_front() {
            self.shared.awaiting_suback.insert(pkid, sender);
        }
    }

    fn complete_subscribe(&self, pkid: u16, codes: &[SubscribeReasonCode]) {
        let Some((_, sender)) = self.shared.awaiting_suback.remove(&pkid) else {
            return;
        };
        let granted = codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
        let outcome = if granted {
            Ok(())
        } else {
            Err("broker refused the subscription".to_string())
        };
        let _ = sender.send(outcome);
    }

    fn connection_lost(&self, error: &ConnectionError) {
        if !self.shared.state.disconnect() {
            debug!(error = %error, "event loop ended after close");
            return;
        }

        let cause = format!("connection lost: {error}");
        warn!(address = %self.shared.address, error = %error, "messaging connection lost");
        self.shared.fail_outstanding(&cause);

        let entries: Vec<Arc<SubscriptionEntry>> = self
            .shared
            .subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for entry in entries {
            if entry.active.load(Ordering::Acquire) {
                guarded("delivery error", || entry.handler.on_error(&cause));
            }
        }
    }
}

/// A connected messaging session.
///
/// Close it explicitly with [`ProtocolSession::close`]; dropping an open
/// session aborts its delivery task.
pub struct MessagingSession {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    endpoint: PortMap,
    client_id: String,
    close_timeout: Duration,
}

impl MessagingSession {
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn endpoint(&self) -> &PortMap {
        &self.endpoint
    }

    /// A producer whose publish outcomes are reported to `events`.
    pub fn publisher<E: PublishEventHandler>(&self, events: E) -> MessagePublisher {
        MessagePublisher {
            shared: Arc::clone(&self.shared),
            events: Arc::new(events),
        }
    }

    /// Subscribe `handler` to `filter`.
    ///
    /// Returns once the broker confirmed the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Subscribe`] if the filter is invalid, the
    /// broker refuses it or does not confirm within the subscribe timeout.
    pub async fn subscribe<H: DeliveryHandler>(
        &self,
        filter: &str,
        handler: H,
    ) -> Result<Subscription> {
        self.register(filter, Arc::new(handler), None).await
    }

    /// Like [`subscribe`](Self::subscribe), also counting `signal` down after
    /// every callback invocation, including ones that panicked.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_with_signal<H: DeliveryHandler>(
        &self,
        filter: &str,
        handler: H,
        signal: CorrelationSignal,
    ) -> Result<Subscription> {
        self.register(filter, Arc::new(handler), Some(signal)).await
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared
            .subscriptions
            .iter()
            .filter(|entry| entry.active.load(Ordering::Acquire))
            .count()
    }

    #[instrument(skip(self, handler, signal), fields(client_id = %self.client_id))]
    async fn register(
        &self,
        filter: &str,
        handler: Arc<dyn DeliveryHandler>,
        signal: Option<CorrelationSignal>,
    ) -> Result<Subscription> {
        self.shared.ensure_connected()?;
        let subscribe_error = |message: String| HarnessError::Subscribe {
            filter: filter.to_string(),
            message,
        };
        topic::validate_filter(filter).map_err(subscribe_error)?;

        let id = self.shared.next_subscription_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(SubscriptionEntry {
            id,
            filter: filter.to_string(),
            handler,
            signal,
            active: AtomicBool::new(true),
            gate: RwLock::new(()),
            failures: Mutex::new(Vec::new()),
            delivered: AtomicU64::new(0),
        });
        // Registered before SUBSCRIBE so nothing sent right after SUBACK is missed
        self.shared.subscriptions.insert(id, Arc::clone(&entry));

        let (sender, receiver) = oneshot::channel();
        let sent = {
            let _order = self.shared.request_order.lock().await;
            self.shared.pending_subscribes.lock().push_back(sender);
            let result = self.shared.client.subscribe(filter, self.shared.qos).await;
            if result.is_err() {
                self.shared.pending_subscribes.lock().pop_back();
            }
            result
        };

        let outcome = match sent {
            Err(e) => Err(e.to_string()),
            Ok(()) => match timeout(self.shared.subscribe_timeout, receiver).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err("session closed before SUBACK".to_string()),
                Err(_) => Err(format!(
                    "no SUBACK within {:?}",
                    self.shared.subscribe_timeout
                )),
            },
        };

        if let Err(message) = outcome {
            entry.active.store(false, Ordering::Release);
            self.shared.subscriptions.remove(&id);
            return Err(subscribe_error(message));
        }

        debug!(filter, subscription_id = id, "subscribed");
        Ok(Subscription {
            entry,
            shared: Arc::clone(&self.shared),
        })
    }
}

#[async_trait]
impl ProtocolSession for MessagingSession {
    fn protocol(&self) -> LogicalPort {
        PROTOCOL
    }

    fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    async fn close(&self) {
        let previous = self.shared.state.close();
        if previous == SessionState::Closed {
            return;
        }

        let entries: Vec<Arc<SubscriptionEntry>> = self
            .shared
            .subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for entry in entries {
            entry.deactivate().await;
        }
        self.shared.subscriptions.clear();

        if previous == SessionState::Connected {
            if let Err(e) = self.shared.client.disconnect().await {
                debug!(error = %e, "disconnect request not delivered");
            }
        }

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if timeout(self.close_timeout, &mut task).await.is_err() {
                warn!(client_id = %self.client_id, "delivery task did not stop in time");
                task.abort();
            }
        }

        self.shared.fail_outstanding("session closed");
        if let Some(metrics) = &self.shared.metrics {
            metrics.session_closed(PROTOCOL);
        }
        info!(client_id = %self.client_id, "messaging session closed");
    }
}

impl Drop for MessagingSession {
    fn drop(&mut self) {
        if self.shared.state.close() == SessionState::Closed {
            return;
        }
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
        for entry in self.shared.subscriptions.iter() {
            entry.active.store(false, Ordering::Release);
        }
        if let Some(metrics) = &self.shared.metrics {
            metrics.session_closed(PROTOCOL);
        }
        debug!(client_id = %self.client_id, "messaging session dropped without close");
    }
}

impl std::fmt::Debug for MessagingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingSession")
            .field("client_id", &self.client_id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.shared.state.get())
            .finish_non_exhaustive()
    }
}

/// Producer bound to a session and a [`PublishEventHandler`].
#[derive(Clone)]
pub struct MessagePublisher {
    shared: Arc<Shared>,
    events: Arc<dyn PublishEventHandler>,
}

#[async_trait]
impl Publisher for MessagePublisher {
    /// Hand `payload` to the transport.
    ///
    /// The acknowledgement or failure is reported later to the bound handler.
    async fn publish(&self, destination: &str, payload: Payload) -> Result<PublishReceipt> {
        let publish_error = |message: String| HarnessError::Publish {
            destination: destination.to_string(),
            status: None,
            message,
        };
        self.shared.ensure_connected()?;
        topic::validate_topic(destination).map_err(publish_error)?;

        let id = self.shared.next_publish_id.fetch_add(1, Ordering::Relaxed) + 1;
        let pending = PendingPublish {
            id,
            events: Arc::clone(&self.events),
        };

        {
            let _order = self.shared.request_order.lock().await;
            self.shared.pending_publishes.lock().push_back(pending);
            let sent = self
                .shared
                .client
                .publish_bytes(destination, self.shared.qos, false, payload.into_bytes())
                .await;
            if let Err(e) = sent {
                self.shared.pending_publishes.lock().pop_back();
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_publish_failure(PROTOCOL);
                }
                return Err(publish_error(e.to_string()));
            }
        }

        if let Some(metrics) = &self.shared.metrics {
            metrics.record_publish(PROTOCOL);
        }
        debug!(publish_id = id, topic = destination, "publish handed to transport");
        Ok(PublishReceipt::Sent { id })
    }
}

/// An active subscription of a [`MessagingSession`].
///
/// Dropping it ends the subscription like [`Subscription::close`], without
/// waiting for a running callback.
#[must_use = "dropping a Subscription ends it"]
pub struct Subscription {
    entry: Arc<SubscriptionEntry>,
    shared: Arc<Shared>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    #[must_use]
    pub fn filter(&self) -> &str {
        &self.entry.filter
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn signal(&self) -> Option<&CorrelationSignal> {
        self.entry.signal.as_ref()
    }

    /// Panic messages caught in this subscription's callback.
    #[must_use]
    pub fn failures(&self) -> Vec<String> {
        self.entry.failures.lock().clone()
    }

    /// Callback invocations that completed without panicking.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.entry.delivered.load(Ordering::Relaxed)
    }

    /// End the subscription.
    ///
    /// No callback starts after this returns; a running one is awaited. The
    /// broker subscription is removed unless another subscription of the
    /// session uses the same filter. Idempotent.
    pub async fn close(&self) {
        if !self.entry.deactivate().await {
            return;
        }
        self.shared.subscriptions.remove(&self.entry.id);

        if self.unsubscribe_needed() {
            if let Err(e) = self.shared.client.unsubscribe(self.entry.filter.clone()).await {
                debug!(filter = %self.entry.filter, error = %e, "unsubscribe not delivered");
            }
        }
        debug!(filter = %self.entry.filter, subscription_id = self.entry.id, "subscription closed");
    }

    fn unsubscribe_needed(&self) -> bool {
        self.shared.state.get() == SessionState::Connected
            && !self.shared.filter_in_use(&self.entry.filter)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.entry.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.subscriptions.remove(&self.entry.id);
        if self.unsubscribe_needed() {
            if let Err(e) = self.shared.client.try_unsubscribe(self.entry.filter.clone()) {
                debug!(filter = %self.entry.filter, error = %e, "unsubscribe not delivered");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.entry.id)
            .field("filter", &self.entry.filter)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_options() -> MessagingOptions {
        MessagingOptions {
            connect_timeout: Duration::from_millis(300),
            ..MessagingOptions::default()
        }
    }

    #[test]
    fn test_options_from_config() {
        let options = MessagingOptions::default();
        assert_eq!(options.qos(), QoS::AtLeastOnce);
        assert_eq!(options.message_vpn, "default");
        assert_eq!(options.keep_alive, Duration::from_secs(30));
        assert!(options.client_id().starts_with("pubsub-harness-"));
    }

    #[test]
    fn test_qos_zero() {
        let options = MessagingOptions {
            qos: 0,
            ..MessagingOptions::default()
        };
        assert_eq!(options.qos(), QoS::AtMostOnce);
    }

    #[test]
    fn test_guarded_catches_panic() {
        assert_eq!(guarded("test", || {}), None);

        let message = guarded("test", || panic!("boom"));
        assert_eq!(message.as_deref(), Some("boom"));

        let formatted = guarded("test", || panic!("bad value {}", 7));
        assert_eq!(formatted.as_deref(), Some("bad value 7"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = PortMap::new(LogicalPort::Mqtt, "127.0.0.1", port);
        let result = MessagingAdapter::new(fast_options())
            .connect(&endpoint, &Credentials::default_client())
            .await;

        match result {
            Err(HarnessError::Connection { protocol, address, .. }) => {
                assert_eq!(protocol, LogicalPort::Mqtt);
                assert_eq!(address, endpoint.address());
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_times_out_without_connack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold the socket without ever answering
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let endpoint = PortMap::new(LogicalPort::Mqtt, "127.0.0.1", port);
        let err = MessagingAdapter::new(fast_options())
            .connect(&endpoint, &Credentials::default_client())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("CONNACK"), "{err}");
        silent.abort();
    }
}
