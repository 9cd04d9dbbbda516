//! Configuration types for the broker test harness.
//!
//! Configuration is loaded from YAML files (or built from defaults) and
//! validated before use. Every section has defaults matching the stock
//! PubSub+ standard image, so an empty document is a valid configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Environment variable naming a YAML file to load in [`HarnessConfig::from_env`].
pub const CONFIG_PATH_ENV: &str = "PUBSUB_HARNESS_CONFIG";

/// Smallest shared memory allocation the broker image accepts.
pub const MIN_SHM_SIZE_BYTES: u64 = 1 << 30;

/// Root configuration for the harness.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Broker instance provisioning.
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Identities used by the harness and by protocol sessions.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Bounds for every blocking operation.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Messaging session settings.
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// REST ingress settings.
    #[serde(default)]
    pub rest: RestConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker instance provisioning configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Image repository, e.g. "solace/solace-pubsub-standard".
    #[serde(default = "default_image")]
    pub image: String,

    /// Image tag.
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Shared memory allocated to the container, in bytes.
    #[serde(default = "default_shm_size_bytes")]
    pub shm_size_bytes: u64,

    /// Connection-count limit applied to the broker.
    #[serde(default = "default_max_connection_count")]
    pub max_connection_count: u32,

    /// How long to wait for the instance to become ready, in seconds.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness checks, in milliseconds.
    #[serde(default = "default_readiness_poll_interval_ms")]
    pub readiness_poll_interval_ms: u64,

    /// Extra environment passed to the container. Overrides generated keys.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A username/password pair.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Credentials {
    /// Username.
    pub username: String,

    /// Password. May be empty for unauthenticated identities.
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    /// Create a new credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The harness-managed admin identity.
    #[must_use]
    pub fn admin() -> Self {
        Self::new("admin", "admin")
    }

    /// The default unauthenticated client identity.
    #[must_use]
    pub fn default_client() -> Self {
        Self::new("default", "")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identities used by the harness.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialsConfig {
    /// Admin identity configured on the instance and used for the management API.
    /// Supports environment variable expansion: "${BROKER_ADMIN_PASSWORD}"
    #[serde(default = "Credentials::admin")]
    pub admin: Credentials,

    /// Identity used by protocol sessions.
    #[serde(default = "Credentials::default_client")]
    pub client: Credentials,

    /// Message VPN protocol sessions join.
    #[serde(default = "default_message_vpn")]
    pub message_vpn: String,
}

/// Timeouts for blocking operations, all in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Session establishment.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// HTTP round trips (REST publish, management requests).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Waiting for the broker to confirm a subscription.
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,

    /// Waiting for a session's delivery task to stop on close.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

/// Messaging session configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagingConfig {
    /// Quality of service for publishes and subscriptions: 0 or 1.
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Capacity of the client request queue.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Prefix for generated client identifiers.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

/// REST ingress configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestConfig {
    /// Content type sent with text payloads.
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_image() -> String {
    "solace/solace-pubsub-standard".to_string()
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_shm_size_bytes() -> u64 {
    MIN_SHM_SIZE_BYTES
}

fn default_max_connection_count() -> u32 {
    100
}

fn default_startup_timeout_secs() -> u64 {
    180
}

fn default_readiness_poll_interval_ms() -> u64 {
    500
}

fn default_message_vpn() -> String {
    "default".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_subscribe_timeout_ms() -> u64 {
    10_000
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    64
}

fn default_client_id_prefix() -> String {
    "pubsub-harness".to_string()
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            tag: default_tag(),
            shm_size_bytes: default_shm_size_bytes(),
            max_connection_count: default_max_connection_count(),
            startup_timeout_secs: default_startup_timeout_secs(),
            readiness_poll_interval_ms: default_readiness_poll_interval_ms(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            admin: Credentials::admin(),
            client: Credentials::default_client(),
            message_vpn: default_message_vpn(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            qos: default_qos(),
            keep_alive_secs: default_keep_alive_secs(),
            channel_capacity: default_channel_capacity(),
            client_id_prefix: default_client_id_prefix(),
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            content_type: default_content_type(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl InstanceConfig {
    /// Full image reference, `image:tag`.
    #[must_use]
    pub fn image_reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Startup timeout as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Readiness poll interval as a [`Duration`].
    #[must_use]
    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    /// Container environment for the given admin identity.
    ///
    /// Generates the admin access level, admin password and connection limit
    /// keys understood by the broker image, then applies `env` on top.
    #[must_use]
    pub fn environment(&self, admin: &Credentials) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            format!("username_{}_globalaccesslevel", admin.username),
            "admin".to_string(),
        );
        env.insert(
            format!("username_{}_password", admin.username),
            admin.password.clone(),
        );
        env.insert(
            "system_scaling_maxconnectioncount".to_string(),
            self.max_connection_count.to_string(),
        );
        for (key, value) in &self.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

impl TimeoutConfig {
    /// Session establishment timeout.
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// HTTP request timeout.
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Subscription confirmation timeout.
    #[must_use]
    pub fn subscribe(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Session close timeout.
    #[must_use]
    pub fn close(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

fn expand_credentials(credentials: &mut Credentials) {
    credentials.username = expand_env_vars(&credentials.username);
    credentials.password = expand_env_vars(&credentials.password);
}

// Configuration loading and validation

impl HarnessConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// Credential fields have `${VAR}` references expanded.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let mut config: Self = serde_yaml::from_str(content)?;
        expand_credentials(&mut config.credentials.admin);
        expand_credentials(&mut config.credentials.client);
        config.validate()?;
        Ok(config)
    }

    /// Load the file named by [`CONFIG_PATH_ENV`], or fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set and the file cannot be loaded.
    pub fn from_env() -> ConfigResult<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.instance.image.trim().is_empty() {
            return Err(invalid("instance.image", "must not be empty"));
        }
        if self.instance.tag.trim().is_empty() {
            return Err(invalid("instance.tag", "must not be empty"));
        }
        if self.instance.shm_size_bytes < MIN_SHM_SIZE_BYTES {
            return Err(invalid(
                "instance.shm_size_bytes",
                format!(
                    "must be at least {MIN_SHM_SIZE_BYTES}, got {}",
                    self.instance.shm_size_bytes
                ),
            ));
        }
        if self.instance.max_connection_count == 0 {
            return Err(invalid("instance.max_connection_count", "must be at least 1"));
        }
        if self.instance.startup_timeout_secs == 0 {
            return Err(invalid("instance.startup_timeout_secs", "must be at least 1"));
        }
        if self.credentials.admin.username.trim().is_empty() {
            return Err(invalid("credentials.admin.username", "must not be empty"));
        }
        if self.credentials.client.username.trim().is_empty() {
            return Err(invalid("credentials.client.username", "must not be empty"));
        }
        if self.messaging.qos > 1 {
            return Err(invalid(
                "messaging.qos",
                format!("must be 0 or 1, got {}", self.messaging.qos),
            ));
        }
        if self.messaging.channel_capacity == 0 {
            return Err(invalid("messaging.channel_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_passes_validation() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.instance.image_reference(),
            "solace/solace-pubsub-standard:latest"
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HarnessConfig::from_str("{}").unwrap();
        assert_eq!(config.instance.shm_size_bytes, 1 << 30);
        assert_eq!(config.instance.max_connection_count, 100);
        assert_eq!(config.credentials.admin, Credentials::admin());
        assert_eq!(config.credentials.client.username, "default");
        assert_eq!(config.credentials.message_vpn, "default");
        assert_eq!(config.messaging.qos, 1);
        assert_eq!(config.rest.content_type, "application/json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_yaml_string() {
        let yaml = r"
instance:
  tag: '10.8'
  max_connection_count: 250
  env:
    logging_debug_output: all
timeouts:
  connect_timeout_ms: 2500
messaging:
  qos: 0
";
        let config = HarnessConfig::from_str(yaml).unwrap();
        assert_eq!(config.instance.tag, "10.8");
        assert_eq!(config.instance.max_connection_count, 250);
        assert_eq!(config.timeouts.connect(), Duration::from_millis(2500));
        assert_eq!(config.timeouts.request_timeout_ms, 30_000);
        assert_eq!(config.messaging.qos, 0);
    }

    #[test]
    fn test_example_file_matches_defaults() {
        let config =
            HarnessConfig::from_str(include_str!("../../../config/harness.example.yaml")).unwrap();
        let defaults = HarnessConfig::default();

        assert_eq!(
            config.instance.image_reference(),
            defaults.instance.image_reference()
        );
        assert_eq!(config.instance.shm_size_bytes, defaults.instance.shm_size_bytes);
        assert_eq!(config.credentials.admin, defaults.credentials.admin);
        assert_eq!(config.credentials.client, defaults.credentials.client);
        assert_eq!(config.timeouts.connect(), defaults.timeouts.connect());
        assert_eq!(config.messaging.qos, defaults.messaging.qos);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_environment_for_admin() {
        let mut instance = InstanceConfig::default();
        instance
            .env
            .insert("system_scaling_maxconnectioncount".to_string(), "1000".to_string());
        instance
            .env
            .insert("logging_debug_output".to_string(), "all".to_string());

        let env = instance.environment(&Credentials::admin());
        assert_eq!(env["username_admin_globalaccesslevel"], "admin");
        assert_eq!(env["username_admin_password"], "admin");
        // Explicit env wins over generated keys
        assert_eq!(env["system_scaling_maxconnectioncount"], "1000");
        assert_eq!(env["logging_debug_output"], "all");
    }

    #[test]
    fn test_shm_size_too_small() {
        let mut config = HarnessConfig::default();
        config.instance.shm_size_bytes = 1_000_000;

        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "instance.shm_size_bytes",
                ..
            })
        ));
    }

    #[test]
    fn test_qos_two_rejected() {
        let yaml = r"
messaging:
  qos: 2
";
        let result = HarnessConfig::from_str(yaml);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "messaging.qos",
                ..
            })
        ));
    }

    #[test]
    fn test_empty_image_rejected() {
        let mut config = HarnessConfig::default();
        config.instance.image = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_var_expansion_in_credentials() {
        std::env::set_var("TEST_HARNESS_ADMIN_PASS", "s3cret");

        let yaml = r"
credentials:
  admin:
    username: admin
    password: '${TEST_HARNESS_ADMIN_PASS}'
";
        let config = HarnessConfig::from_str(yaml).unwrap();
        assert_eq!(config.credentials.admin.password, "s3cret");

        std::env::remove_var("TEST_HARNESS_ADMIN_PASS");
    }

    #[test]
    fn test_env_var_expansion_missing_var() {
        assert_eq!(expand_env_vars("${HARNESS_NONEXISTENT_VAR}"), "");
        assert_eq!(expand_env_vars("literal"), "literal");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_from_file_missing() {
        let result = HarnessConfig::from_file("/nonexistent/harness.yaml");
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }
}
