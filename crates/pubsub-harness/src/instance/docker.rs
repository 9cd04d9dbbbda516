//! Docker-backed launcher and the broker readiness probe.
//!
//! The launcher runs the broker image through testcontainers and publishes
//! every logical port on an ephemeral host port.

use std::time::Duration;

use async_trait::async_trait;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::adapter::management::MSG_VPNS_PATH;
use crate::config::Credentials;
use crate::error::{HarnessError, Result};

use super::launcher::{LaunchPlan, Launcher, ReadinessProbe, RunningInstance};
use super::port::{LogicalPort, PortTable};

/// Ports that must accept TCP before the broker counts as ready.
const PROBED_PORTS: [LogicalPort; 3] = [LogicalPort::Smf, LogicalPort::Mqtt, LogicalPort::Rest];

/// Per-attempt bound on a single readiness check step.
const PROBE_STEP_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches the broker as a Docker container.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerLauncher;

impl DockerLauncher {
    /// Create a new Docker launcher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    #[instrument(skip(self, plan), fields(image = %plan.image_reference()))]
    async fn launch(&self, plan: &LaunchPlan) -> Result<Box<dyn RunningInstance>> {
        let mut image = GenericImage::new(plan.image.clone(), plan.tag.clone());
        for port in &plan.ports {
            image = image.with_exposed_port(port.container_port().tcp());
        }

        let mut request = image
            .with_shm_size(plan.shm_size_bytes)
            .with_startup_timeout(plan.startup_timeout);
        for (key, value) in &plan.env {
            request = request.with_env_var(key.clone(), value.clone());
        }

        info!(shm_size_bytes = plan.shm_size_bytes, "starting broker container");

        let container = match timeout(plan.startup_timeout, request.start()).await {
            Ok(Ok(container)) => container,
            Ok(Err(e)) => {
                return Err(HarnessError::provisioning(format!(
                    "failed to start {}: {e}",
                    plan.image_reference()
                )))
            }
            Err(_) => {
                return Err(HarnessError::provisioning(format!(
                    "container start for {} exceeded {:?}",
                    plan.image_reference(),
                    plan.startup_timeout
                )))
            }
        };

        let id = container.id().to_string();
        debug!(container_id = %id, "broker container running");

        Ok(Box::new(DockerInstance {
            id,
            container: Some(container),
        }))
    }
}

/// A running broker container.
struct DockerInstance {
    id: String,
    container: Option<ContainerAsync<GenericImage>>,
}

#[async_trait]
impl RunningInstance for DockerInstance {
    fn id(&self) -> &str {
        &self.id
    }

    async fn port_table(&self, ports: &[LogicalPort]) -> Result<PortTable> {
        let container = self
            .container
            .as_ref()
            .ok_or_else(|| HarnessError::provisioning("container already removed"))?;

        let host = container
            .get_host()
            .await
            .map_err(|e| HarnessError::provisioning(format!("failed to resolve host: {e}")))?
            .to_string();
        // Ports are resolved as IPv4 mappings; avoid "localhost" resolving to ::1
        let host = if host == "localhost" {
            "127.0.0.1".to_string()
        } else {
            host
        };

        let mut table = PortTable::new(host);
        for port in ports {
            let mapped = container
                .get_host_port_ipv4(port.container_port().tcp())
                .await
                .map_err(|e| {
                    HarnessError::provisioning(format!(
                        "port {} ({}) is not published: {e}",
                        port.container_port(),
                        port
                    ))
                })?;
            table.insert(*port, mapped);
        }
        Ok(table)
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(container) = self.container.take() else {
            return Ok(());
        };
        container.rm().await.map_err(|e| {
            HarnessError::provisioning(format!("failed to remove container {}: {e}", self.id))
        })
    }
}

impl Drop for DockerInstance {
    fn drop(&mut self) {
        if self.container.is_some() {
            // ContainerAsync removes itself on drop
            warn!(container_id = %self.id, "broker container dropped without stop");
        }
    }
}

/// Readiness check against the live broker.
///
/// Ready means the messaging ports accept TCP connections and the management
/// API lists message VPNs for the admin identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrokerReadinessProbe;

impl BrokerReadinessProbe {
    /// Create a new probe.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReadinessProbe for BrokerReadinessProbe {
    async fn check(&self, ports: &PortTable, admin: &Credentials) -> std::result::Result<(), String> {
        for logical in PROBED_PORTS {
            let Some(map) = ports.get(logical) else {
                continue;
            };
            match timeout(PROBE_STEP_TIMEOUT, TcpStream::connect(map.address())).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(format!("{logical} port not accepting: {e}")),
                Err(_) => return Err(format!("{logical} port connect timed out")),
            }
        }

        let management = ports
            .get(LogicalPort::Management)
            .ok_or_else(|| "management port not mapped".to_string())?;
        let client = reqwest::Client::builder()
            .timeout(PROBE_STEP_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        let url = management.http_url(MSG_VPNS_PATH).map_err(|e| e.to_string())?;
        let response = client
            .get(url)
            .basic_auth(&admin.username, Some(&admin.password))
            .send()
            .await
            .map_err(|e| format!("management API unreachable: {e}"))?;

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(format!("management API answered {status}"))
        }
    }
}
