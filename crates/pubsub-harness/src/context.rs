//! The harness context: one broker instance plus adapters bound to it.
//!
//! Construction starts the instance and waits until it is ready; test code
//! then asks the context for endpoints, credentials and sessions. Teardown
//! is explicit via [`HarnessContext::shutdown`], except for the shared
//! context, which is stopped when the process exits.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use crate::adapter::{
    ManagementApiAdapter, ManagementSession, MessagingAdapter, MessagingOptions,
    MessagingSession, RestIngressAdapter, RestSession,
};
use crate::config::{Credentials, HarnessConfig};
use crate::error::{HarnessError, Result};
use crate::instance::{
    BrokerReadinessProbe, DockerLauncher, InstanceLifecycle, Launcher, LifecycleState,
    LogicalPort, PortMap, ReadinessProbe,
};
use crate::metrics::HarnessMetrics;

/// Process-wide context; a failed start is cached as its message.
static SHARED: OnceCell<std::result::Result<HarnessContext, String>> = OnceCell::const_new();

/// Composes the instance lifecycle and the protocol adapters.
pub struct HarnessContext {
    config: HarnessConfig,
    lifecycle: InstanceLifecycle,
    metrics: Arc<HarnessMetrics>,
    messaging: MessagingAdapter,
    rest: RestIngressAdapter,
    management: ManagementApiAdapter,
}

impl HarnessContext {
    /// Start a broker container described by `config` and wait until ready.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] for an invalid configuration and
    /// [`HarnessError::Provisioning`] if the broker cannot be started.
    pub async fn start(config: HarnessConfig) -> Result<Self> {
        Self::with_launcher(
            config,
            Arc::new(DockerLauncher::new()),
            Arc::new(BrokerReadinessProbe::new()),
        )
        .await
    }

    /// Like [`start`](Self::start) with an explicit launcher and probe.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    #[instrument(skip_all, fields(image = %config.instance.image_reference()))]
    pub async fn with_launcher(
        config: HarnessConfig,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(HarnessMetrics::new());
        let lifecycle = InstanceLifecycle::new(&config, launcher, probe);
        lifecycle.start().await?;

        let messaging = MessagingAdapter::new(MessagingOptions::from_config(&config))
            .with_metrics(Arc::clone(&metrics));
        let rest = RestIngressAdapter::new(&config).with_metrics(Arc::clone(&metrics));
        let management =
            ManagementApiAdapter::new(&config).with_metrics(Arc::clone(&metrics));

        Ok(Self {
            config,
            lifecycle,
            metrics,
            messaging,
            rest,
            management,
        })
    }

    /// The process-wide context, started on first call from
    /// [`HarnessConfig::from_env`].
    ///
    /// The instance is stopped once, best effort, when the process exits
    /// normally. A process killed before that leaves the container behind.
    /// If the first start failed, every call returns that failure without
    /// retrying.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Provisioning`] if the shared start failed.
    pub async fn shared() -> Result<&'static HarnessContext> {
        let outcome = SHARED
            .get_or_init(|| async {
                let config = HarnessConfig::from_env().map_err(|e| e.to_string())?;
                let started = Self::start(config).await.map_err(|e| e.to_string());
                if started.is_ok() {
                    register_exit_teardown();
                }
                started
            })
            .await;

        outcome
            .as_ref()
            .map_err(|message| HarnessError::provisioning(message.clone()))
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<HarnessMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Host every port is published on.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InstanceNotReady`] after shutdown.
    pub fn host(&self) -> Result<&str> {
        self.lifecycle.host()
    }

    /// Host port of `logical`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InstanceNotReady`] after shutdown.
    pub fn port_for(&self, logical: LogicalPort) -> Result<u16> {
        Ok(self.lifecycle.port_map(logical)?.port())
    }

    /// Full mapping of `logical`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InstanceNotReady`] after shutdown.
    pub fn endpoint(&self, logical: LogicalPort) -> Result<PortMap> {
        self.lifecycle.port_map(logical)
    }

    #[must_use]
    pub fn admin_credentials(&self) -> &Credentials {
        &self.config.credentials.admin
    }

    #[must_use]
    pub fn default_credentials(&self) -> &Credentials {
        &self.config.credentials.client
    }

    #[must_use]
    pub fn message_vpn(&self) -> &str {
        &self.config.credentials.message_vpn
    }

    /// Connect a messaging session with the default client identity.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InstanceNotReady`] after shutdown and
    /// [`HarnessError::Connection`] if the broker refuses the session.
    pub async fn connect_messaging(&self) -> Result<MessagingSession> {
        self.connect_messaging_as(self.default_credentials()).await
    }

    /// Connect a messaging session as `credentials`.
    ///
    /// # Errors
    ///
    /// See [`connect_messaging`](Self::connect_messaging).
    pub async fn connect_messaging_as(&self, credentials: &Credentials) -> Result<MessagingSession> {
        let endpoint = self.endpoint(LogicalPort::Mqtt)?;
        self.messaging.connect(&endpoint, credentials).await
    }

    /// Open a REST ingress session with the default client identity.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InstanceNotReady`] after shutdown and
    /// [`HarnessError::Connection`] if the REST port does not accept.
    pub async fn connect_rest(&self) -> Result<RestSession> {
        let endpoint = self.endpoint(LogicalPort::Rest)?;
        self.rest.connect(&endpoint, self.default_credentials()).await
    }

    /// Open a management session with the admin identity.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InstanceNotReady`] after shutdown and
    /// [`HarnessError::Connection`] if the management port does not accept.
    pub async fn connect_management(&self) -> Result<ManagementSession> {
        let endpoint = self.endpoint(LogicalPort::Management)?;
        self.management
            .connect(&endpoint, self.admin_credentials())
            .await
    }

    /// Stop the broker instance. Idempotent and infallible.
    ///
    /// Sessions still open afterwards fail on their next operation.
    pub async fn shutdown(&self) {
        self.lifecycle.stop().await;
        info!("harness shut down");
    }

    /// [`shutdown`](Self::shutdown) for callers outside any runtime.
    ///
    /// Runs on a dedicated thread with its own current-thread runtime, so it
    /// is also safe while the calling thread's runtime is gone or blocked.
    pub fn shutdown_blocking(&self) {
        std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name("harness-teardown".to_string())
                .spawn_scoped(scope, || {
                    match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime.block_on(self.shutdown()),
                        Err(e) => warn!(error = %e, "no runtime for harness teardown"),
                    }
                });
            match worker {
                Ok(handle) => {
                    if handle.join().is_err() {
                        warn!("harness teardown panicked");
                    }
                }
                Err(e) => warn!(error = %e, "harness teardown thread not started"),
            }
        });
    }
}

/// Stop the shared instance, if one was started.
fn teardown_shared() {
    if let Some(Ok(ctx)) = SHARED.get() {
        ctx.shutdown_blocking();
    }
}

extern "C" fn teardown_shared_at_exit() {
    teardown_shared();
}

/// Arrange for [`teardown_shared`] to run when the process exits.
fn register_exit_teardown() {
    // SAFETY: the handler is a plain function that never unwinds
    #[allow(unsafe_code)]
    let registered = unsafe { libc::atexit(teardown_shared_at_exit) };
    if registered != 0 {
        warn!("exit teardown not registered; the shared instance will outlive the process");
    }
}

impl std::fmt::Debug for HarnessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessContext")
            .field("image", &self.config.instance.image_reference())
            .field("state", &self.lifecycle.state())
            .field("ports", &self.lifecycle.ports().ok())
            .finish_non_exhaustive()
    }
}
