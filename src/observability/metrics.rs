//! # Metrics Collection
//!
//! Prometheus metrics for discovery passes, certificates and xDS streams.

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};
use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Metrics recorder that tracks control plane activity
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome and duration of a discovery pass
    pub fn record_discovery_pass(&self, reason: &str, success: bool, duration: f64) {
        let status = if success { "success" } else { "error" };
        let labels = [("reason", reason.to_string()), ("status", status.to_string())];
        counter!("discovery_passes_total", &labels).increment(1);
        histogram!("discovery_pass_duration_seconds").record(duration);
    }

    /// Record a service skipped during a pass
    pub fn record_service_skipped(&self, cause: &str) {
        let labels = [("cause", cause.to_string())];
        counter!("discovery_services_skipped_total", &labels).increment(1);
    }

    /// Update snapshot resource gauges after a publish
    pub fn update_snapshot_resources(&self, clusters: usize, listeners: usize, secrets: usize) {
        gauge!("snapshot_resources", "resource_type" => "cluster").set(clusters as f64);
        gauge!("snapshot_resources", "resource_type" => "listener").set(listeners as f64);
        gauge!("snapshot_resources", "resource_type" => "secret").set(secrets as f64);
        counter!("snapshot_publications_total").increment(1);
    }

    /// Record a certificate issuing attempt
    pub fn record_certificate_issued(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        let labels = [("status", status.to_string())];
        counter!("acme_certificates_issued_total", &labels).increment(1);
    }

    /// Update lifecycle queue sizes
    pub fn update_certificate_queues(&self, backlog: usize, renewals: usize) {
        gauge!("acme_issue_backlog").set(backlog as f64);
        gauge!("acme_renewal_list").set(renewals as f64);
    }

    /// Record an xDS stream connection event
    pub fn record_xds_connection(&self, node_id: &str, connected: bool) {
        let labels = [("node_id", node_id.to_string())];
        if connected {
            gauge!("xds_connections_total", &labels).increment(1.0);
        } else {
            gauge!("xds_connections_total", &labels).decrement(1.0);
        }
    }

    /// Record an xDS request/response outcome
    pub fn record_xds_request(&self, type_url: &str, success: bool) {
        let status_label = if success { "ack" } else { "nack" };
        let labels = [("type_url", type_url.to_string()), ("status", status_label.to_string())];
        counter!("xds_requests_total", &labels).increment(1);
    }

    /// Register descriptions so exports appear before the first event
    pub fn register_metrics(&self) {
        describe_counter!("discovery_passes_total", Unit::Count, "Discovery passes by outcome");
        describe_histogram!(
            "discovery_pass_duration_seconds",
            Unit::Seconds,
            "Wall time of a discovery pass"
        );
        describe_counter!(
            "discovery_services_skipped_total",
            Unit::Count,
            "Services skipped because of invalid labels or conflicts"
        );
        describe_gauge!("snapshot_resources", Unit::Count, "Resources in the published snapshot");
        describe_counter!("snapshot_publications_total", Unit::Count, "Snapshots published");
        describe_counter!(
            "acme_certificates_issued_total",
            Unit::Count,
            "Certificate issuing attempts by outcome"
        );
        describe_gauge!("acme_issue_backlog", Unit::Count, "Domain sets waiting for issuing");
        describe_gauge!("acme_renewal_list", Unit::Count, "Domain sets tracked for renewal");
        describe_gauge!("xds_connections_total", Unit::Count, "Connected xDS streams");
        describe_counter!("xds_requests_total", Unit::Count, "xDS requests by ACK/NACK");
    }
}

/// Initialize the Prometheus exporter
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().register_metrics();

    info!(metrics_addr = %metrics_addr, service_name = %config.service_name, "Metrics collection initialized");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let recorder = MetricsRecorder::new();

        recorder.record_discovery_pass("initial discovery", true, 0.12);
        recorder.record_discovery_pass("a swarm service changed", false, 5.0);
        recorder.record_service_skipped("labels");
        recorder.update_snapshot_resources(3, 2, 1);
        recorder.record_certificate_issued(true);
        recorder.update_certificate_queues(1, 4);
        recorder.record_xds_connection("envoy-1", true);
        recorder.record_xds_request("type.googleapis.com/envoy.config.cluster.v3.Cluster", true);
        recorder.record_xds_connection("envoy-1", false);
    }

    #[test]
    fn test_init_metrics_disabled() {
        let config = ObservabilityConfig { enable_metrics: false, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_init_metrics_no_port() {
        let config =
            ObservabilityConfig { enable_metrics: true, metrics_port: 0, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }
}
