//! # Configuration Settings
//!
//! Defines the configuration structure for the edgeplane control plane.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// xDS server configuration
    #[validate(nested)]
    pub xds: XdsConfig,

    /// Docker Swarm registry configuration
    #[validate(nested)]
    pub registry: RegistryConfig,

    /// ACME certificate configuration
    #[validate(nested)]
    pub acme: AcmeConfig,

    /// Certificate storage configuration
    #[validate(nested)]
    pub storage: StorageConfig,

    /// Discovery loop configuration
    #[validate(nested)]
    pub discovery: DiscoveryConfig,

    /// Logging and metrics configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()?;

        Ok(())
    }

    fn validate_custom(&self) -> Result<()> {
        if self.acme.enabled && self.acme.email.trim().is_empty() {
            return Err(Error::validation_field(
                "An ACME account email is required when ACME is enabled",
                "acme.email",
            ));
        }

        if self.acme.enabled && self.acme.challenge_port == self.xds.port {
            return Err(Error::validation("xDS and ACME challenge ports cannot be the same"));
        }

        if self.observability.enable_metrics && self.observability.metrics_port == self.xds.port {
            return Err(Error::validation("xDS and metrics ports cannot be the same"));
        }

        Ok(())
    }
}

/// xDS server configuration for Envoy communication
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct XdsConfig {
    /// xDS server bind address
    #[validate(length(min = 1, message = "xDS bind address cannot be empty"))]
    pub bind_address: String,

    /// xDS server port
    #[validate(range(min = 1, message = "xDS port must be between 1 and 65535"))]
    pub port: u16,

    /// Name of the cluster in the Envoy bootstrap that points back at this control plane.
    /// Secret (SDS) references are resolved through it.
    #[validate(length(min = 1, message = "Control plane cluster name cannot be empty"))]
    pub control_plane_cluster: String,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9876,
            control_plane_cluster: "control_plane".to_string(),
        }
    }
}

impl XdsConfig {
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Docker Swarm registry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RegistryConfig {
    /// Docker Engine endpoint, `unix:///path` or `tcp://host:port`
    #[validate(length(min = 1, message = "Docker host cannot be empty"))]
    pub docker_host: String,

    /// Name or ID of the overlay network shared by Envoy and the services
    #[validate(length(min = 1, message = "Ingress network cannot be empty"))]
    pub ingress_network: String,

    /// Cap for the resubscribe backoff when the event stream fails
    #[validate(range(min = 1, max = 300, message = "Backoff cap must be between 1 and 300 seconds"))]
    pub max_backoff_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            docker_host: "unix:///var/run/docker.sock".to_string(),
            ingress_network: "edge-traffic".to_string(),
            max_backoff_seconds: 30,
        }
    }
}

impl RegistryConfig {
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }
}

/// ACME (LetsEncrypt) configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AcmeConfig {
    /// Enable automatic certificate issuing
    pub enabled: bool,

    /// Account contact email
    pub email: String,

    /// ACME directory URL
    #[validate(url(message = "ACME directory must be a valid URL"))]
    pub directory_url: String,

    /// Cluster the `/.well-known` route forwards to
    #[validate(length(min = 1, message = "ACME cluster name cannot be empty"))]
    pub cluster_name: String,

    /// Address the HTTP-01 challenge responder binds to
    pub challenge_bind_address: String,

    /// Port of the HTTP-01 challenge responder
    #[validate(range(min = 1, message = "Challenge port must be between 1 and 65535"))]
    pub challenge_port: u16,

    /// DNS name Envoy uses to reach the challenge responder. When set, the ACME
    /// cluster is published together with the service clusters.
    pub challenge_address: Option<String>,

    /// Seconds between issuing sweeps over the backlog
    #[validate(range(min = 1, message = "Issue interval must be positive"))]
    pub issue_interval_seconds: u64,

    /// Seconds between renewal checks
    #[validate(range(min = 60, message = "Renewal check interval must be at least 60 seconds"))]
    pub renewal_interval_seconds: u64,

    /// Renew certificates expiring within this many days
    #[validate(range(min = 1, max = 60, message = "Renew window must be between 1 and 60 days"))]
    pub renew_before_days: i64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: String::new(),
            directory_url: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
            cluster_name: "control_plane_acme".to_string(),
            challenge_bind_address: "0.0.0.0".to_string(),
            challenge_port: 8080,
            challenge_address: None,
            issue_interval_seconds: 60,
            renewal_interval_seconds: 86370,
            renew_before_days: 30,
        }
    }
}

impl AcmeConfig {
    pub fn issue_interval(&self) -> Duration {
        Duration::from_secs(self.issue_interval_seconds)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_seconds)
    }

    pub fn renew_before(&self) -> chrono::Duration {
        chrono::Duration::days(self.renew_before_days)
    }

    pub fn challenge_socket_address(&self) -> String {
        format!("{}:{}", self.challenge_bind_address, self.challenge_port)
    }
}

/// Certificate storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding certificates and ACME account data
    #[validate(length(min = 1, message = "Storage directory cannot be empty"))]
    pub directory: String,

    /// S3 compatible bucket mirroring the directory. The directory then acts
    /// as a read-through cache.
    #[validate(nested)]
    pub object: Option<ObjectStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { directory: "/var/lib/edgeplane".to_string(), object: None }
    }
}

/// S3 compatible object storage (AWS S3, MinIO)
#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObjectStorageConfig {
    /// Base URL of the object store, buckets are addressed path style
    #[validate(url(message = "Object storage endpoint must be a valid URL"))]
    pub endpoint: String,

    #[validate(length(min = 3, max = 63, message = "Bucket name must be 3 to 63 characters"))]
    pub bucket: String,

    #[validate(length(min = 1, message = "Object storage region cannot be empty"))]
    pub region: String,

    #[validate(length(min = 1, message = "Object storage access key cannot be empty"))]
    pub access_key: String,

    #[validate(length(min = 1, message = "Object storage secret key cannot be empty"))]
    pub secret_key: String,

    /// Deadline for a single object operation
    #[validate(range(min = 1, max = 60, message = "Object storage timeout must be between 1 and 60 seconds"))]
    pub timeout_seconds: u64,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            timeout_seconds: 3,
        }
    }
}

impl ObjectStorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl std::fmt::Debug for ObjectStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorageConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

/// What the event loop does when a discovery pass fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the error and stop the control plane
    #[default]
    Exit,
    /// Keep serving the last snapshot and retry the pass with backoff
    Retry,
}

/// Discovery loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Deadline for a single discovery pass
    #[validate(range(min = 5, max = 30, message = "Discovery timeout must be between 5 and 30 seconds"))]
    pub timeout_seconds: u64,

    /// Failure handling for discovery passes
    pub on_error: FailurePolicy,

    /// Attempts per event when `on_error` is `retry`
    #[validate(range(min = 1, max = 20, message = "Retry attempts must be between 1 and 20"))]
    pub retry_max_attempts: u32,

    /// Cap for the retry backoff
    #[validate(range(min = 1, max = 300, message = "Retry backoff cap must be between 1 and 300 seconds"))]
    pub retry_max_backoff_seconds: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 5,
            on_error: FailurePolicy::Exit,
            retry_max_attempts: 5,
            retry_max_backoff_seconds: 30,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_max_backoff_seconds)
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) when `RUST_LOG` is unset
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Enable the Prometheus exporter
    pub enable_metrics: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    /// Service name attached to metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: false,
            metrics_port: 9090,
            service_name: "edgeplane".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_acme_requires_email() {
        let mut config = AppConfig::default();
        config.acme.enabled = true;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("email"));

        config.acme.email = "ops@example.com".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_object_storage_is_validated_when_present() {
        let mut config = AppConfig::default();
        config.storage.object = Some(ObjectStorageConfig {
            endpoint: "not a url".to_string(),
            bucket: "certificates".to_string(),
            access_key: "minio".to_string(),
            secret_key: "minio-secret".to_string(),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        if let Some(object) = config.storage.object.as_mut() {
            object.endpoint = "https://minio.internal:9000".to_string();
        }
        assert!(config.validate().is_ok());

        let printed = format!("{:?}", config.storage);
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("minio-secret"));
    }

    #[test]
    fn test_discovery_timeout_bounds() {
        let mut config = AppConfig::default();
        config.discovery.timeout_seconds = 2;
        assert!(config.validate().is_err());

        config.discovery.timeout_seconds = 31;
        assert!(config.validate().is_err());

        config.discovery.timeout_seconds = 30;
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_port_conflicts_rejected() {
        let mut config = AppConfig::default();
        config.acme.enabled = true;
        config.acme.email = "ops@example.com".to_string();
        config.acme.challenge_port = config.xds.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_acme_intervals() {
        let config = AcmeConfig::default();
        assert_eq!(config.issue_interval(), Duration::from_secs(60));
        assert_eq!(config.renewal_interval(), Duration::from_secs(86370));
        assert_eq!(config.renew_before(), chrono::Duration::days(30));
        assert_eq!(config.challenge_socket_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_observability_config_metrics_address() {
        let config = ObservabilityConfig { metrics_port: 9090, ..Default::default() };
        assert_eq!(config.metrics_bind_address(), Some("0.0.0.0:9090".to_string()));

        let disabled = ObservabilityConfig { metrics_port: 0, ..Default::default() };
        assert_eq!(disabled.metrics_bind_address(), None);
    }

    #[test]
    fn test_failure_policy_serde() {
        let policy: FailurePolicy = serde_json::from_str("\"retry\"").unwrap();
        assert_eq!(policy, FailurePolicy::Retry);
        assert_eq!(serde_json::to_string(&FailurePolicy::Exit).unwrap(), "\"exit\"");
    }
}
