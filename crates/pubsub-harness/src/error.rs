//! Domain error types for the broker test harness.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use std::time::Duration;

use thiserror::Error;

use crate::instance::{LifecycleState, LogicalPort};

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A field holds a value the harness cannot work with.
    #[error("invalid value for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

/// Errors surfaced by the harness to test code.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The broker instance failed to start or never became ready.
    ///
    /// Fatal to the whole run: every test shares the one instance.
    #[error("broker provisioning failed: {message}")]
    Provisioning { message: String },

    /// An adapter could not establish a session.
    #[error("{protocol} connection to {address} failed: {message}")]
    Connection {
        protocol: LogicalPort,
        address: String,
        message: String,
    },

    /// A publish was rejected locally or by the broker.
    #[error("publish to '{destination}' failed: {message}")]
    Publish {
        destination: String,
        status: Option<u16>,
        message: String,
    },

    /// Subscription registration failed.
    #[error("subscribe to '{filter}' failed: {message}")]
    Subscribe { filter: String, message: String },

    /// A bounded wait elapsed before the awaited event.
    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// An endpoint was queried before the instance reached `Ready`.
    #[error("broker instance not ready (state: {state:?})")]
    InstanceNotReady { state: LifecycleState },

    /// The session was already closed.
    #[error("{protocol} session is closed")]
    SessionClosed { protocol: LogicalPort },

    /// The management API answered with something the harness could not use.
    #[error("management API error: {message}")]
    Management { status: u16, message: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl HarnessError {
    /// Shorthand for a provisioning failure.
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    /// Check whether this error is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
