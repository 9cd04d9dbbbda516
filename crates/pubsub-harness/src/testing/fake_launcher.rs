//! In-process stand-ins for the container runtime.
//!
//! [`FakeLauncher`] hands out instances whose ports point wherever the test
//! wants (typically a [`MockHttpServer`](super::MockHttpServer)), and
//! [`ScriptedProbe`] reports readiness after a fixed number of checks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Credentials;
use crate::error::{HarnessError, Result};
use crate::instance::{LaunchPlan, Launcher, LogicalPort, PortTable, ReadinessProbe, RunningInstance};

/// First fake host port handed out when no explicit ports are configured.
const FAKE_PORT_BASE: u16 = 41000;

/// Launcher that never touches Docker.
#[derive(Debug)]
pub struct FakeLauncher {
    host: String,
    ports: BTreeMap<LogicalPort, u16>,
    failure: Option<String>,
    launches: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl FakeLauncher {
    /// Launcher assigning distinct fake ports on `127.0.0.1`.
    #[must_use]
    pub fn new() -> Self {
        let ports = LogicalPort::ALL
            .iter()
            .zip(FAKE_PORT_BASE..)
            .map(|(logical, port)| (*logical, port))
            .collect();
        Self::with_ports("127.0.0.1", ports)
    }

    /// Launcher publishing every logical port on the same `host:port`.
    #[must_use]
    pub fn all_on(host: impl Into<String>, port: u16) -> Self {
        let ports = LogicalPort::ALL.iter().map(|logical| (*logical, port)).collect();
        Self::with_ports(host, ports)
    }

    /// Launcher publishing the given ports on `host`.
    #[must_use]
    pub fn with_ports(host: impl Into<String>, ports: BTreeMap<LogicalPort, u16>) -> Self {
        Self {
            host: host.into(),
            ports,
            failure: None,
            launches: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Launcher whose every launch fails with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new()
        }
    }

    /// Number of launch attempts.
    #[must_use]
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Number of instances stopped.
    #[must_use]
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, _spec: &LaunchPlan) -> Result<Box<dyn RunningInstance>> {
        let attempt = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(message) = &self.failure {
            return Err(HarnessError::provisioning(message.clone()));
        }

        Ok(Box::new(FakeInstance {
            id: format!("fake-{attempt}"),
            host: self.host.clone(),
            ports: self.ports.clone(),
            stops: Arc::clone(&self.stops),
            stopped: false,
        }))
    }
}

struct FakeInstance {
    id: String,
    host: String,
    ports: BTreeMap<LogicalPort, u16>,
    stops: Arc<AtomicUsize>,
    stopped: bool,
}

#[async_trait]
impl RunningInstance for FakeInstance {
    fn id(&self) -> &str {
        &self.id
    }

    async fn port_table(&self, ports: &[LogicalPort]) -> Result<PortTable> {
        let mut table = PortTable::new(self.host.clone());
        for logical in ports {
            let port = self.ports.get(logical).copied().ok_or_else(|| {
                HarnessError::provisioning(format!("fake instance does not publish {logical}"))
            })?;
            table.insert(*logical, port);
        }
        Ok(table)
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.stopped {
            self.stopped = true;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Probe that reports ready from the `n`-th check on.
#[derive(Debug)]
pub struct ScriptedProbe {
    ready_from: Option<usize>,
    checks: AtomicUsize,
}

impl ScriptedProbe {
    /// Ready on the `checks`-th call (1 means immediately).
    #[must_use]
    pub fn ready_after(checks: usize) -> Self {
        Self {
            ready_from: Some(checks.max(1)),
            checks: AtomicUsize::new(0),
        }
    }

    /// Ready on the first check.
    #[must_use]
    pub fn always_ready() -> Self {
        Self::ready_after(1)
    }

    /// Never ready.
    #[must_use]
    pub fn never_ready() -> Self {
        Self {
            ready_from: None,
            checks: AtomicUsize::new(0),
        }
    }

    /// Number of checks performed so far.
    #[must_use]
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn check(&self, _ports: &PortTable, _admin: &Credentials) -> std::result::Result<(), String> {
        let attempt = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        match self.ready_from {
            Some(ready_from) if attempt >= ready_from => Ok(()),
            _ => Err(format!("scripted: not ready on check {attempt}")),
        }
    }
}
