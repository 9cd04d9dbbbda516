//! Mock MQTT broker for messaging session tests.
//!
//! A lightweight in-process broker that:
//! - Accepts MQTT 3.1.1 connections
//! - Records every publish it receives
//! - Routes publishes to every connection with a matching filter
//! - Can refuse connections or filters, withhold acks and drop connections

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rumqttc::mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, Publish, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::{Error as CodecError, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::adapter::topic;

const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// A publish received by the broker.
#[derive(Debug, Clone)]
pub struct RecordedPublish {
    /// Client id of the publishing connection.
    pub client_id: String,
    pub topic: String,
    /// 0 or 1.
    pub qos: u8,
    pub payload: Bytes,
}

struct Connection {
    client_id: String,
    filters: Vec<String>,
    outbound: mpsc::UnboundedSender<Publish>,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<u64, Connection>,
    publishes: Vec<RecordedPublish>,
    clients: Vec<String>,
}

#[derive(Default)]
struct Behavior {
    refuse_connections: AtomicBool,
    withhold_acks: AtomicBool,
    refused_filters: Mutex<Vec<String>>,
}

/// Mock MQTT broker for testing.
pub struct MockMqttBroker {
    address: String,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    drop_tx: broadcast::Sender<()>,
    next_connection: Arc<AtomicU64>,
    state: Arc<Mutex<BrokerState>>,
    behavior: Arc<Behavior>,
}

impl MockMqttBroker {
    /// Create a new mock broker that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        let (drop_tx, _) = broadcast::channel(1);
        Self {
            address: address.into(),
            local_addr: None,
            shutdown_tx: None,
            drop_tx,
            next_connection: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(BrokerState::default())),
            behavior: Arc::new(Behavior::default()),
        }
    }

    /// Start the mock broker.
    ///
    /// Returns the actual address the broker is listening on.
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

        let mut shutdown_rx = shutdown_tx.subscribe();
        let drop_tx = self.drop_tx.clone();
        let next_connection = Arc::clone(&self.next_connection);
        let state = Arc::clone(&self.state);
        let behavior = Arc::clone(&self.behavior);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        let handler = ConnectionHandler {
                            id: next_connection.fetch_add(1, Ordering::Relaxed),
                            state: Arc::clone(&state),
                            behavior: Arc::clone(&behavior),
                        };
                        let shutdown_rx = shutdown_tx.subscribe();
                        let drop_rx = drop_tx.subscribe();
                        tokio::spawn(handler.run(stream, shutdown_rx, drop_rx));
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop the mock broker, closing every connection.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Close every open connection without a DISCONNECT. New connections
    /// are still accepted.
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    /// Answer CONNECT with a refusal.
    pub fn refuse_connections(&self, refuse: bool) {
        self.behavior.refuse_connections.store(refuse, Ordering::Release);
    }

    /// Stop sending PUBACK for QoS 1 publishes.
    pub fn withhold_acks(&self, withhold: bool) {
        self.behavior.withhold_acks.store(withhold, Ordering::Release);
    }

    /// Answer SUBSCRIBE to `filter` with a failure code.
    pub fn refuse_filter(&self, filter: impl Into<String>) {
        self.behavior.refused_filters.lock().push(filter.into());
    }

    /// All publishes received, in arrival order.
    #[must_use]
    pub fn publishes(&self) -> Vec<RecordedPublish> {
        self.state.lock().publishes.clone()
    }

    /// Client ids of every accepted CONNECT.
    #[must_use]
    pub fn clients(&self) -> Vec<String> {
        self.state.lock().clients.clone()
    }

    /// Filters currently subscribed across all connections.
    #[must_use]
    pub fn filters(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut filters: Vec<String> = state
            .connections
            .values()
            .flat_map(|connection| connection.filters.iter().cloned())
            .collect();
        filters.sort();
        filters
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Get the listening address once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

enum Flow {
    Continue,
    Close,
}

struct ConnectionHandler {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    behavior: Arc<Behavior>,
}

impl ConnectionHandler {
    async fn run(
        self,
        stream: TcpStream,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut drop_rx: broadcast::Receiver<()>,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Publish>();
        let mut buffer = BytesMut::with_capacity(4096);

        'connection: loop {
            loop {
                let packet = match v4::read(&mut buffer, MAX_PACKET_SIZE) {
                    Ok(packet) => packet,
                    Err(CodecError::InsufficientBytes(_)) => break,
                    Err(_) => break 'connection,
                };
                let mut out = BytesMut::new();
                let flow = match self.handle(packet, &outbound_tx, &mut out) {
                    Ok(flow) => flow,
                    Err(_) => break 'connection,
                };
                if !out.is_empty() && writer.write_all(&out).await.is_err() {
                    break 'connection;
                }
                if matches!(flow, Flow::Close) {
                    break 'connection;
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = drop_rx.recv() => break,
                read = reader.read_buf(&mut buffer) => {
                    if matches!(read, Ok(0) | Err(_)) {
                        break;
                    }
                }
                Some(publish) = outbound_rx.recv() => {
                    if Self::forward(&mut writer, &publish).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.state.lock().connections.remove(&self.id);
    }

    async fn forward(writer: &mut OwnedWriteHalf, publish: &Publish) -> std::io::Result<()> {
        let mut out = BytesMut::new();
        publish
            .write(&mut out)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.write_all(&out).await
    }

    fn handle(
        &self,
        packet: Packet,
        outbound: &mpsc::UnboundedSender<Publish>,
        out: &mut BytesMut,
    ) -> Result<Flow, CodecError> {
        match packet {
            Packet::Connect(connect) => {
                if self.behavior.refuse_connections.load(Ordering::Acquire) {
                    ConnAck::new(ConnectReturnCode::BadUserNamePassword, false).write(out)?;
                    return Ok(Flow::Close);
                }
                let mut state = self.state.lock();
                state.clients.push(connect.client_id.clone());
                state.connections.insert(
                    self.id,
                    Connection {
                        client_id: connect.client_id,
                        filters: Vec::new(),
                        outbound: outbound.clone(),
                    },
                );
                ConnAck::new(ConnectReturnCode::Success, false).write(out)?;
            }
            Packet::Subscribe(subscribe) => {
                let refused = self.behavior.refused_filters.lock().clone();
                let mut codes = Vec::with_capacity(subscribe.filters.len());
                let mut state = self.state.lock();
                for filter in subscribe.filters {
                    if refused.contains(&filter.path) {
                        codes.push(SubscribeReasonCode::Failure);
                        continue;
                    }
                    if let Some(connection) = state.connections.get_mut(&self.id) {
                        if !connection.filters.contains(&filter.path) {
                            connection.filters.push(filter.path);
                        }
                    }
                    codes.push(SubscribeReasonCode::Success(filter.qos));
                }
                SubAck::new(subscribe.pkid, codes).write(out)?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                if let Some(connection) = self.state.lock().connections.get_mut(&self.id) {
                    connection
                        .filters
                        .retain(|filter| !unsubscribe.topics.contains(filter));
                }
                UnsubAck::new(unsubscribe.pkid).write(out)?;
            }
            Packet::Publish(publish) => {
                self.route(&publish);
                if publish.qos == QoS::AtLeastOnce
                    && !self.behavior.withhold_acks.load(Ordering::Acquire)
                {
                    PubAck::new(publish.pkid).write(out)?;
                }
            }
            Packet::PingReq => {
                PingResp.write(out)?;
            }
            Packet::Disconnect => return Ok(Flow::Close),
            _ => {}
        }
        Ok(Flow::Continue)
    }

    /// Record `publish` and hand a QoS 0 copy to every matching connection.
    fn route(&self, publish: &Publish) {
        let mut state = self.state.lock();
        let client_id = state
            .connections
            .get(&self.id)
            .map(|connection| connection.client_id.clone())
            .unwrap_or_default();
        state.publishes.push(RecordedPublish {
            client_id,
            topic: publish.topic.clone(),
            qos: publish.qos as u8,
            payload: publish.payload.clone(),
        });

        for connection in state.connections.values() {
            let matched = connection
                .filters
                .iter()
                .any(|filter| topic::matches(filter, &publish.topic));
            if matched {
                let copy =
                    Publish::from_bytes(publish.topic.clone(), QoS::AtMostOnce, publish.payload.clone());
                let _ = connection.outbound.send(copy);
            }
        }
    }
}
