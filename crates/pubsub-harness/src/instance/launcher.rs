//! Seams between the lifecycle state machine and the container runtime.
//!
//! [`Launcher`] starts an instance, [`RunningInstance`] reports its mapped
//! ports and tears it down, and [`ReadinessProbe`] decides when the broker
//! inside is able to serve clients.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Credentials, HarnessConfig};
use crate::error::Result;

use super::port::{LogicalPort, PortTable};

/// Everything a launcher needs to start one broker instance.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Image repository.
    pub image: String,
    /// Image tag.
    pub tag: String,
    /// Shared memory size in bytes.
    pub shm_size_bytes: u64,
    /// Container environment.
    pub env: BTreeMap<String, String>,
    /// Logical ports to publish on the host.
    pub ports: Vec<LogicalPort>,
    /// Upper bound on the launch itself (image pull and container start).
    pub startup_timeout: Duration,
}

impl LaunchPlan {
    /// Build the launch plan described by `config`.
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            image: config.instance.image.clone(),
            tag: config.instance.tag.clone(),
            shm_size_bytes: config.instance.shm_size_bytes,
            env: config.instance.environment(&config.credentials.admin),
            ports: LogicalPort::ALL.to_vec(),
            startup_timeout: config.instance.startup_timeout(),
        }
    }

    /// Full image reference, `image:tag`.
    #[must_use]
    pub fn image_reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Starts broker instances.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start an instance described by `plan`.
    ///
    /// Returns once the container runtime reports the instance as running;
    /// readiness of the broker inside is checked separately.
    async fn launch(&self, plan: &LaunchPlan) -> Result<Box<dyn RunningInstance>>;
}

/// A launched instance, owned by the lifecycle.
#[async_trait]
pub trait RunningInstance: Send + Sync {
    /// Runtime identifier (container id).
    fn id(&self) -> &str;

    /// Resolve the host and the host port of every logical port in `ports`.
    async fn port_table(&self, ports: &[LogicalPort]) -> Result<PortTable>;

    /// Stop and remove the instance.
    ///
    /// Called at most once by the lifecycle. Failures are reported but the
    /// instance is considered gone afterwards.
    async fn stop(&mut self) -> Result<()>;
}

/// Decides whether a launched broker is ready to serve clients.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Perform one readiness check.
    ///
    /// Returns `Err` with a human-readable reason while not ready; the
    /// lifecycle keeps polling until the startup deadline.
    async fn check(&self, ports: &PortTable, admin: &Credentials) -> std::result::Result<(), String>;
}
