//! Broker instance provisioning.
//!
//! - [`port`]: logical service ports and their host mappings
//! - [`launcher`]: launch/readiness seams
//! - [`docker`]: the testcontainers-backed launcher and broker probe
//! - [`lifecycle`]: the exactly-once start/stop state machine

pub mod docker;
pub mod launcher;
pub mod lifecycle;
pub mod port;

pub use docker::{BrokerReadinessProbe, DockerLauncher};
pub use launcher::{LaunchPlan, Launcher, ReadinessProbe, RunningInstance};
pub use lifecycle::{InstanceLifecycle, LifecycleState};
pub use port::{LogicalPort, PortMap, PortTable};
