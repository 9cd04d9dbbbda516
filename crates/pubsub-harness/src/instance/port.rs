//! Logical service ports and their runtime host mappings.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// A named service endpoint exposed by the broker at a fixed container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalPort {
    /// Native messaging protocol (SMF).
    Smf,
    /// Browser web transport.
    WebTransport,
    /// AMQP 1.0.
    Amqp,
    /// MQTT over TCP.
    Mqtt,
    /// MQTT over WebSockets.
    MqttWeb,
    /// REST messaging ingress.
    Rest,
    /// SEMP management API.
    Management,
}

impl LogicalPort {
    /// Every port the instance exposes, in launch order.
    pub const ALL: [LogicalPort; 7] = [
        Self::Smf,
        Self::WebTransport,
        Self::Amqp,
        Self::Mqtt,
        Self::MqttWeb,
        Self::Rest,
        Self::Management,
    ];

    /// The port the broker listens on inside the container.
    #[must_use]
    pub fn container_port(&self) -> u16 {
        match self {
            Self::Smf => 55555,
            Self::WebTransport => 8008,
            Self::Amqp => 5672,
            Self::Mqtt => 1883,
            Self::MqttWeb => 8000,
            Self::Rest => 9000,
            Self::Management => 8080,
        }
    }

    /// Short protocol name used in logs and metric labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Smf => "smf",
            Self::WebTransport => "web_transport",
            Self::Amqp => "amqp",
            Self::Mqtt => "mqtt",
            Self::MqttWeb => "mqtt_web",
            Self::Rest => "rest",
            Self::Management => "management",
        }
    }
}

impl fmt::Display for LogicalPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Externally reachable address of one logical port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortMap {
    logical: LogicalPort,
    host: String,
    port: u16,
}

impl PortMap {
    /// Create a new mapping.
    pub fn new(logical: LogicalPort, host: impl Into<String>, port: u16) -> Self {
        Self {
            logical,
            host: host.into(),
            port,
        }
    }

    /// The logical port this mapping belongs to.
    #[must_use]
    pub fn logical(&self) -> LogicalPort {
        self.logical
    }

    /// Host the port is published on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host-side port number.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form, as used for TCP connect strings.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build a plain HTTP URL for `path` on this endpoint.
    ///
    /// `path` is split on `/`; each segment is percent-encoded, so `?`, `#`
    /// and `%` in a topic stay part of the path. A leading slash is optional.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Connection`] if the host does not form a
    /// valid URL.
    pub fn http_url(&self, path: &str) -> Result<Url> {
        let invalid = |message: String| HarnessError::Connection {
            protocol: self.logical,
            address: self.address(),
            message,
        };
        let mut url = Url::parse(&format!("http://{}/", self.address()))
            .map_err(|e| invalid(format!("invalid endpoint URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| invalid("endpoint URL cannot carry a path".to_string()))?
            .clear()
            .extend(path.trim_start_matches('/').split('/'));
        Ok(url)
    }
}

impl fmt::Display for PortMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.logical, self.host, self.port)
    }
}

/// The complete set of port mappings of one running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTable {
    host: String,
    ports: BTreeMap<LogicalPort, PortMap>,
}

impl PortTable {
    /// Create an empty table for `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ports: BTreeMap::new(),
        }
    }

    /// Record the host port assigned to `logical`.
    pub fn insert(&mut self, logical: LogicalPort, port: u16) {
        let map = PortMap::new(logical, self.host.clone(), port);
        self.ports.insert(logical, map);
    }

    /// Host every port is published on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Look up the mapping for `logical`.
    #[must_use]
    pub fn get(&self, logical: LogicalPort) -> Option<&PortMap> {
        self.ports.get(&logical)
    }

    /// Iterate over all mappings.
    pub fn iter(&self) -> impl Iterator<Item = &PortMap> {
        self.ports.values()
    }

    /// Number of mapped ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether no port has been mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_ports_are_distinct() {
        let mut ports: Vec<u16> = LogicalPort::ALL.iter().map(LogicalPort::container_port).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), LogicalPort::ALL.len());
    }

    #[test]
    fn test_well_known_container_ports() {
        assert_eq!(LogicalPort::Management.container_port(), 8080);
        assert_eq!(LogicalPort::Rest.container_port(), 9000);
        assert_eq!(LogicalPort::Smf.container_port(), 55555);
        assert_eq!(LogicalPort::Mqtt.container_port(), 1883);
    }

    #[test]
    fn test_port_map_address_and_url() {
        let map = PortMap::new(LogicalPort::Rest, "localhost", 49153);
        assert_eq!(map.address(), "localhost:49153");
        assert_eq!(
            map.http_url("http/topic").unwrap().as_str(),
            "http://localhost:49153/http/topic"
        );
        assert_eq!(
            map.http_url("/http/topic").unwrap().as_str(),
            "http://localhost:49153/http/topic"
        );
        assert_eq!(
            map.http_url("/SEMP/v2/config/msgVpns").unwrap().as_str(),
            "http://localhost:49153/SEMP/v2/config/msgVpns"
        );
    }

    #[test]
    fn test_http_url_encodes_reserved_characters() {
        let map = PortMap::new(LogicalPort::Rest, "localhost", 49153);

        let url = map.http_url("orders/a?b#c").unwrap();
        assert_eq!(url.as_str(), "http://localhost:49153/orders/a%3Fb%23c");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);

        let url = map.http_url("discount/100% off").unwrap();
        assert_eq!(url.path(), "/discount/100%25%20off");
    }

    #[test]
    fn test_http_url_rejects_invalid_host() {
        let map = PortMap::new(LogicalPort::Management, "bad host", 8080);
        assert!(matches!(
            map.http_url("/SEMP"),
            Err(HarnessError::Connection {
                protocol: LogicalPort::Management,
                ..
            })
        ));
    }

    #[test]
    fn test_port_table_lookup() {
        let mut table = PortTable::new("127.0.0.1");
        table.insert(LogicalPort::Smf, 32001);
        table.insert(LogicalPort::Management, 32002);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(LogicalPort::Smf).unwrap().port(), 32001);
        assert_eq!(table.get(LogicalPort::Management).unwrap().host(), "127.0.0.1");
        assert!(table.get(LogicalPort::Amqp).is_none());
    }

    #[test]
    fn test_logical_port_yaml_names() {
        let port: LogicalPort = serde_yaml::from_str("mqtt_web").unwrap();
        assert_eq!(port, LogicalPort::MqttWeb);
        assert_eq!(LogicalPort::MqttWeb.to_string(), "mqtt_web");
    }
}
