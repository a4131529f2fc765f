//! gRPC discovery services over the published snapshots
//!
//! Envoy fetches clusters and listeners over ADS and, following the SDS
//! config source in the TLS chains, secrets over the secret discovery service.
//! The single-type CDS and LDS services are served as well so proxies
//! bootstrapped without ADS still work.

use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::AggregatedDiscoveryService, DeltaDiscoveryRequest,
    DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryService;
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryService;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::info;

use super::stream::{create_resource_response, run_stream_loop};
use crate::xds::resources::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL, SECRET_TYPE_URL};
use crate::xds::state::XdsState;

type ResponseStream =
    Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;
type DeltaResponseStream =
    Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

/// Serves ADS, CDS, LDS and SDS from one [`XdsState`]
#[derive(Debug, Clone)]
pub struct EdgeDiscoveryService {
    state: Arc<XdsState>,
    shutdown: CancellationToken,
}

impl EdgeDiscoveryService {
    pub fn new(state: Arc<XdsState>, shutdown: CancellationToken) -> Self {
        Self { state, shutdown }
    }

    fn stream(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
        fixed_type: Option<&'static str>,
        label: &'static str,
    ) -> Response<ResponseStream> {
        info!(stream = label, remote = ?request.remote_addr(), "New xDS stream connection established");
        let stream = run_stream_loop(
            self.state.clone(),
            request.into_inner(),
            fixed_type,
            label,
            self.shutdown.clone(),
        );
        Response::new(Box::pin(stream))
    }

    fn fetch(
        &self,
        request: Request<DiscoveryRequest>,
        type_url: &'static str,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        let request = request.into_inner();
        let group = self.state.group_of(request.node.as_ref());
        create_resource_response(&self.state, &group, type_url, &request.resource_names)
            .map(Response::new)
            .ok_or_else(|| Status::unavailable("no configuration published yet"))
    }
}

fn delta_unsupported() -> Status {
    Status::unimplemented("incremental xDS is not supported, use state of the world")
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for EdgeDiscoveryService {
    type StreamAggregatedResourcesStream = ResponseStream;
    type DeltaAggregatedResourcesStream = DeltaResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(self.stream(request, None, "ads"))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(delta_unsupported())
    }
}

#[tonic::async_trait]
impl ClusterDiscoveryService for EdgeDiscoveryService {
    type StreamClustersStream = ResponseStream;
    type DeltaClustersStream = DeltaResponseStream;

    async fn stream_clusters(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamClustersStream>, Status> {
        Ok(self.stream(request, Some(CLUSTER_TYPE_URL), "cds"))
    }

    async fn delta_clusters(
        &self,
        _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaClustersStream>, Status> {
        Err(delta_unsupported())
    }

    async fn fetch_clusters(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, CLUSTER_TYPE_URL)
    }
}

#[tonic::async_trait]
impl ListenerDiscoveryService for EdgeDiscoveryService {
    type StreamListenersStream = ResponseStream;
    type DeltaListenersStream = DeltaResponseStream;

    async fn stream_listeners(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamListenersStream>, Status> {
        Ok(self.stream(request, Some(LISTENER_TYPE_URL), "lds"))
    }

    async fn delta_listeners(
        &self,
        _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaListenersStream>, Status> {
        Err(delta_unsupported())
    }

    async fn fetch_listeners(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, LISTENER_TYPE_URL)
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for EdgeDiscoveryService {
    type StreamSecretsStream = ResponseStream;
    type DeltaSecretsStream = DeltaResponseStream;

    async fn stream_secrets(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamSecretsStream>, Status> {
        Ok(self.stream(request, Some(SECRET_TYPE_URL), "sds"))
    }

    async fn delta_secrets(
        &self,
        _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaSecretsStream>, Status> {
        Err(delta_unsupported())
    }

    async fn fetch_secrets(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, SECRET_TYPE_URL)
    }
}
