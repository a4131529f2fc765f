//! Envoy xDS configuration and transport
//!
//! Builders turn the services of a discovery pass into Envoy clusters,
//! listeners and secrets. Published [`Snapshot`]s live in [`XdsState`] and are
//! served to proxies over a tonic gRPC server:
//! - ADS (Aggregated Discovery Service)
//! - CDS and LDS for proxies bootstrapped without ADS
//! - SDS (Secret Discovery Service) for TLS certificates

pub mod cluster;
pub mod filter_chain;
pub mod listener;
pub mod resources;
pub mod route;
pub mod secret;
pub mod services;
pub mod snapshot;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer;
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryServiceServer;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

pub use listener::{ListenerProvider, ListenerSet};
pub use resources::BuiltResource;
pub use route::VhostCollection;
pub use secret::CertificateSecretsProvider;
pub use services::EdgeDiscoveryService;
pub use snapshot::{NodeHash, Snapshot, SnapshotCache, StaticHash, EDGE_GROUP};
pub use state::XdsState;

use crate::config::XdsConfig;
use crate::Result;

/// Serve the published snapshots until `shutdown` is cancelled
pub async fn start_xds_server(
    config: &XdsConfig,
    state: Arc<XdsState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = config
        .socket_address()
        .parse()
        .map_err(|e| crate::Error::config(format!("Invalid xDS address: {}", e)))?;

    let service = EdgeDiscoveryService::new(state, shutdown.clone());

    info!(address = %addr, "Starting Envoy xDS server");

    Server::builder()
        .add_service(AggregatedDiscoveryServiceServer::new(service.clone()))
        .add_service(ClusterDiscoveryServiceServer::new(service.clone()))
        .add_service(ListenerDiscoveryServiceServer::new(service.clone()))
        .add_service(SecretDiscoveryServiceServer::new(service))
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            let error_msg = e.to_string();
            if error_msg.contains("Address already in use") || error_msg.contains("bind") {
                crate::Error::transport(format!(
                    "XDS server failed to bind to {}: Port {} is already in use. Please use a different port or stop the existing service.",
                    addr,
                    addr.port()
                ))
            } else {
                crate::Error::transport(format!("XDS server failed: {}", e))
            }
        })?;

    info!("xDS server stopped");
    Ok(())
}
