//! Exactly-once lifecycle of the shared broker instance.
//!
//! State machine:
//!
//! ```text
//! NotStarted --start--> Starting --ready--> Ready --stop--> Stopped
//!                          |                                  ^
//!                          +--launch/readiness failure--> Failed
//!                          +--stop------------------------------+
//! ```
//!
//! `start` is serialized by a gate so concurrent callers observe a single
//! launch. Once `Ready`, the port table is written exactly once and read
//! without locking.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::{Credentials, HarnessConfig};
use crate::error::{HarnessError, Result};

use super::launcher::{LaunchPlan, Launcher, ReadinessProbe, RunningInstance};
use super::port::{LogicalPort, PortMap, PortTable};

/// Lifecycle state of the broker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// `start` has not been called.
    NotStarted = 0,
    /// Launch or readiness wait in progress.
    Starting = 1,
    /// Ports are mapped and the broker serves clients.
    Ready = 2,
    /// Torn down; never recreated within the run.
    Stopped = 3,
    /// Launch or readiness failed; later starts fail fast.
    Failed = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

/// Owns the one broker instance of a harness.
pub struct InstanceLifecycle {
    plan: LaunchPlan,
    admin: Credentials,
    poll_interval: Duration,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ReadinessProbe>,
    state: AtomicU8,
    stop_requested: AtomicBool,
    ports: OnceLock<PortTable>,
    start_gate: tokio::sync::Mutex<()>,
    instance: tokio::sync::Mutex<Option<Box<dyn RunningInstance>>>,
    failure: Mutex<Option<String>>,
}

impl InstanceLifecycle {
    /// Create a lifecycle for the instance described by `config`.
    #[must_use]
    pub fn new(
        config: &HarnessConfig,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        Self {
            plan: LaunchPlan::from_config(config),
            admin: config.credentials.admin.clone(),
            poll_interval: config.instance.readiness_poll_interval(),
            launcher,
            probe,
            state: AtomicU8::new(LifecycleState::NotStarted as u8),
            stop_requested: AtomicBool::new(false),
            ports: OnceLock::new(),
            start_gate: tokio::sync::Mutex::new(()),
            instance: tokio::sync::Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The launch parameters of this instance.
    #[must_use]
    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Start the instance and wait until it is ready.
    ///
    /// A call while `Ready` returns immediately. A call after `Failed` returns
    /// the recorded failure without retrying. A call after `Stopped` fails:
    /// the instance is never recreated within a run.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Provisioning`] if the launch fails, the broker
    /// does not become ready before the startup timeout, or `stop` is called
    /// while starting.
    #[instrument(skip(self), fields(image = %self.plan.image_reference()))]
    pub async fn start(&self) -> Result<()> {
        let _gate = self.start_gate.lock().await;

        match self.state() {
            LifecycleState::Ready => return Ok(()),
            LifecycleState::Failed => {
                let cause = self.failure.lock().clone().unwrap_or_default();
                return Err(HarnessError::provisioning(format!(
                    "instance failed earlier: {cause}"
                )));
            }
            LifecycleState::Stopped => {
                return Err(HarnessError::provisioning(
                    "instance was stopped and is not recreated within a run",
                ))
            }
            LifecycleState::NotStarted | LifecycleState::Starting => {}
        }

        if !self.transition(LifecycleState::NotStarted, LifecycleState::Starting) {
            return Err(HarnessError::provisioning("instance was stopped during startup"));
        }

        let deadline = Instant::now() + self.plan.startup_timeout;
        let outcome = self.launch_and_wait(deadline).await;

        if self.stop_requested.load(Ordering::Acquire) {
            self.teardown().await;
            return Err(HarnessError::provisioning("instance was stopped during startup"));
        }

        match outcome {
            Ok(table) => {
                let smf_port = table.get(LogicalPort::Smf).map(PortMap::port);
                let host = table.host().to_string();
                let _ = self.ports.set(table);

                if !self.transition(LifecycleState::Starting, LifecycleState::Ready) {
                    self.teardown().await;
                    return Err(HarnessError::provisioning(
                        "instance was stopped during startup",
                    ));
                }

                info!(host = %host, smf_port = ?smf_port, "broker instance ready");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "broker instance failed to start");
                *self.failure.lock() = Some(e.to_string());
                self.teardown().await;
                self.transition(LifecycleState::Starting, LifecycleState::Failed);
                Err(e)
            }
        }
    }

    async fn launch_and_wait(&self, deadline: Instant) -> Result<PortTable> {
        let instance = match timeout_at(deadline, self.launcher.launch(&self.plan)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HarnessError::provisioning(format!(
                    "launch did not complete within {:?}",
                    self.plan.startup_timeout
                )))
            }
        };
        debug!(instance_id = instance.id(), "instance launched");

        let table = instance.port_table(&self.plan.ports).await;
        *self.instance.lock().await = Some(instance);
        let table = table?;

        let mut attempt = 0u32;
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return Err(HarnessError::provisioning("instance was stopped during startup"));
            }

            attempt += 1;
            let reason = match timeout_at(deadline, self.probe.check(&table, &self.admin)).await {
                Ok(Ok(())) => {
                    debug!(attempt, "readiness check passed");
                    return Ok(table);
                }
                Ok(Err(reason)) => reason,
                Err(_) => "readiness check did not finish".to_string(),
            };

            if Instant::now() + self.poll_interval >= deadline {
                return Err(HarnessError::provisioning(format!(
                    "broker not ready within {:?} after {attempt} checks: {reason}",
                    self.plan.startup_timeout
                )));
            }
            debug!(attempt, reason = %reason, "broker not ready yet");
            sleep(self.poll_interval).await;
        }
    }

    /// Stop and forget the running instance, if any. Never fails.
    async fn teardown(&self) {
        let instance = self.instance.lock().await.take();
        if let Some(mut instance) = instance {
            let id = instance.id().to_string();
            match instance.stop().await {
                Ok(()) => info!(instance_id = %id, "broker instance stopped"),
                Err(e) => warn!(instance_id = %id, error = %e, "failed to stop broker instance"),
            }
        }
    }

    /// Stop the instance.
    ///
    /// Idempotent and infallible: stop errors are logged. Calling it before
    /// `start` prevents any later start.
    pub async fn stop(&self) {
        loop {
            let current = self.state();
            match current {
                LifecycleState::Stopped | LifecycleState::Failed => return,
                LifecycleState::NotStarted | LifecycleState::Starting | LifecycleState::Ready => {
                    if self.transition(current, LifecycleState::Stopped) {
                        if current == LifecycleState::Starting {
                            self.stop_requested.store(true, Ordering::Release);
                        }
                        self.teardown().await;
                        return;
                    }
                }
            }
        }
    }

    /// Host every port is published on.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InstanceNotReady`] unless the state is `Ready`.
    pub fn host(&self) -> Result<&str> {
        Ok(self.ready_ports()?.host())
    }

    /// Resolve the external address of `logical`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InstanceNotReady`] unless the state is `Ready`.
    pub fn port_map(&self, logical: LogicalPort) -> Result<PortMap> {
        self.ready_ports()?.get(logical).cloned().ok_or_else(|| {
            HarnessError::provisioning(format!("port {logical} was not published"))
        })
    }

    /// All port mappings of the ready instance.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InstanceNotReady`] unless the state is `Ready`.
    pub fn ports(&self) -> Result<&PortTable> {
        self.ready_ports()
    }

    fn ready_ports(&self) -> Result<&PortTable> {
        let state = self.state();
        match (state, self.ports.get()) {
            (LifecycleState::Ready, Some(table)) => Ok(table),
            _ => Err(HarnessError::InstanceNotReady { state }),
        }
    }
}
