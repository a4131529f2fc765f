//! # Structured Logging
//!
//! Subscriber setup plus span macros used by the discovery pipeline.
//!
//! Components never log through an ambient global target of their own: each one
//! receives a [`tracing::Span`] at construction and enters it around its work,
//! so every event carries the component name.

use crate::config::ObservabilityConfig;
use tracing_subscriber::EnvFilter;

/// Create a tracing span for one discovery pass
#[macro_export]
macro_rules! discovery_span {
    ($reason:expr) => {
        tracing::info_span!(
            "discovery_pass",
            reason = %$reason,
            pass_id = %uuid::Uuid::new_v4(),
            version = tracing::field::Empty
        )
    };
    ($reason:expr, $($field:tt)*) => {
        tracing::info_span!(
            "discovery_pass",
            reason = %$reason,
            pass_id = %uuid::Uuid::new_v4(),
            version = tracing::field::Empty,
            $($field)*
        )
    };
}

/// Span handed to a long-lived component at construction time
pub fn component_span(component: &'static str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this twice keeps the
/// first subscriber.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let _ = if config.json_logging {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        xds_address = %config.xds.socket_address(),
        docker_host = %config.registry.docker_host,
        ingress_network = %config.registry.ingress_network,
        acme_enabled = %config.acme.enabled,
        storage_directory = %config.storage.directory,
        object_storage_bucket = ?config.storage.object.as_ref().map(|object| object.bucket.as_str()),
        discovery_timeout_s = config.discovery.timeout_seconds,
        on_error = ?config.discovery.on_error,
        metrics_enabled = %config.observability.enable_metrics,
        "edgeplane control plane configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = discovery_span!("initial discovery");
        let _span = discovery_span!("a swarm service changed", services = 3);
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        let config = ObservabilityConfig::default();
        init_logging(&config);
        init_logging(&config);
    }

    #[test]
    fn test_log_config_info() {
        let config = crate::config::AppConfig::default();
        log_config_info(&config);
    }
}
