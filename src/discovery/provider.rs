//! Swarm backed [`AdsProvider`]

use std::sync::Arc;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use tracing::{debug, info, warn, Instrument, Span};

use super::AdsProvider;
use crate::domain::ServiceIntent;
use crate::observability::MetricsRecorder;
use crate::registry::{NetworkDescriptor, ServiceRegistry, SWARM_SCOPE};
use crate::xds::cluster::service_cluster;
use crate::xds::resources::CLUSTER_TYPE_URL;
use crate::xds::{BuiltResource, ListenerProvider, VhostCollection};
use crate::{Error, Result};

/// Clusters and vhosts of one pass, before listeners are built
#[derive(Debug, Default)]
pub struct Discovered {
    pub clusters: Vec<Cluster>,
    pub vhosts: VhostCollection,
}

/// Builds clusters and listeners from the services on the ingress network
pub struct SwarmProvider {
    registry: Arc<dyn ServiceRegistry>,
    ingress_network: String,
    listeners: ListenerProvider,
    acme_cluster: Option<Cluster>,
    metrics: MetricsRecorder,
    span: Span,
}

impl SwarmProvider {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        ingress_network: impl Into<String>,
        listeners: ListenerProvider,
        span: Span,
    ) -> Self {
        Self {
            registry,
            ingress_network: ingress_network.into(),
            listeners,
            acme_cluster: None,
            metrics: MetricsRecorder::new(),
            span,
        }
    }

    /// Publish the cluster of the HTTP-01 challenge responder with every pass
    pub fn with_acme_cluster(mut self, cluster: Cluster) -> Self {
        self.acme_cluster = Some(cluster);
        self
    }

    /// Turn the services attached to the ingress network into clusters and vhosts.
    ///
    /// Services that cannot be exposed are skipped; registry failures and
    /// errors not scoped to one service fail the call.
    pub async fn discover(&self) -> Result<Discovered> {
        let ingress = self.ingress().await?;
        let services = self.registry.list_services().await?;
        debug!(services = services.len(), ingress = %ingress.id, "Listed swarm services");

        let mut discovered = Discovered::default();
        for service in services {
            let intent = ServiceIntent::parse(&service.labels);
            if let Err(e) = intent.validate() {
                debug!(service = %service.name, reason = %e, "Skipping service with invalid labels");
                self.metrics.record_service_skipped("labels");
                continue;
            }

            if !service.is_attached_to(&ingress.id) {
                warn!(
                    service = %service.name,
                    network = %ingress.name,
                    "service is not connected to the ingress network"
                );
                self.metrics.record_service_skipped("network");
                continue;
            }

            let cluster = match service_cluster(&service.name, &intent) {
                Ok(cluster) => cluster,
                Err(e) if e.is_service_scoped() => {
                    warn!(service = %service.name, error = %e, "Skipping service with an invalid cluster");
                    self.metrics.record_service_skipped("cluster");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match discovered.vhosts.add_service(&service.name, &intent) {
                Ok(()) => {}
                Err(e) if e.is_service_scoped() => {
                    warn!(service = %service.name, error = %e, "Skipping service with a conflicting route");
                    self.metrics.record_service_skipped("conflict");
                    continue;
                }
                Err(e) => return Err(e),
            }

            discovered.clusters.push(cluster);
        }

        if let Some(cluster) = &self.acme_cluster {
            discovered.clusters.push(cluster.clone());
        }

        info!(
            clusters = discovered.clusters.len(),
            vhosts = discovered.vhosts.len(),
            "Discovered swarm services"
        );
        Ok(discovered)
    }

    async fn ingress(&self) -> Result<NetworkDescriptor> {
        let network = self.registry.inspect_network(&self.ingress_network).await?;
        if network.scope != SWARM_SCOPE {
            return Err(Error::config(
                "the provided ingress network is not scoped for the entire cluster (swarm)",
            ));
        }
        Ok(network)
    }
}

#[async_trait]
impl AdsProvider for SwarmProvider {
    async fn provide(&self) -> Result<(Vec<BuiltResource>, Vec<BuiltResource>)> {
        async {
            let discovered = self.discover().await?;
            let listeners = self.listeners.provide_listeners(&discovered.vhosts).await?;

            let clusters = discovered
                .clusters
                .iter()
                .map(|cluster| BuiltResource::new(cluster.name.clone(), CLUSTER_TYPE_URL, cluster))
                .collect();
            Ok((clusters, listeners.into_resources()))
        }
        .instrument(self.span.clone())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, ServiceDescriptor, VirtualIp};
    use crate::storage::{FileCertificateStore, MemoryStorage};
    use crate::xds::cluster::acme_cluster;
    use crate::xds::CertificateSecretsProvider;
    use std::collections::HashMap;

    const INGRESS_ID: &str = "ingress-1";

    fn registry() -> MemoryRegistry {
        let registry = MemoryRegistry::new();
        registry.add_network(NetworkDescriptor {
            id: INGRESS_ID.to_string(),
            name: "edge".to_string(),
            scope: SWARM_SCOPE.to_string(),
        });
        registry
    }

    fn service(name: &str, labels: &[(&str, &str)], network: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            id: format!("{}-id", name),
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            virtual_ips: vec![VirtualIp {
                network_id: network.to_string(),
                addr: "10.0.0.2/24".to_string(),
            }],
        }
    }

    fn provider(registry: MemoryRegistry) -> SwarmProvider {
        let store = Arc::new(FileCertificateStore::new(Arc::new(MemoryStorage::new())));
        let secrets =
            Arc::new(CertificateSecretsProvider::new("control_plane", store, Span::none()));
        let listeners = ListenerProvider::new(secrets, None, Span::none());
        SwarmProvider::new(Arc::new(registry), "edge", listeners, Span::none())
    }

    #[tokio::test]
    async fn exposes_labelled_services_on_the_ingress_network() {
        let registry = registry();
        registry.set_services(vec![
            service(
                "web",
                &[("envoy.endpoint.port", "8080"), ("envoy.route.domain", "example.com")],
                INGRESS_ID,
            ),
            service("db", &[], INGRESS_ID),
            service(
                "internal",
                &[("envoy.endpoint.port", "80"), ("envoy.route.domain", "internal.com")],
                "other-network",
            ),
        ]);

        let discovered = provider(registry).discover().await.unwrap();

        let names: Vec<_> = discovered.clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["web"]);
        assert_eq!(discovered.vhosts.len(), 1);
        assert!(discovered.vhosts.get("example.com").is_some());
    }

    #[tokio::test]
    async fn conflicting_service_is_skipped_without_its_cluster() {
        let registry = registry();
        registry.set_services(vec![
            service(
                "serviceA",
                &[
                    ("envoy.endpoint.port", "80"),
                    ("envoy.route.domain", "a.com"),
                    ("envoy.route.extra-domains", "shared.com"),
                ],
                INGRESS_ID,
            ),
            service(
                "serviceB",
                &[
                    ("envoy.endpoint.port", "80"),
                    ("envoy.route.domain", "b.com"),
                    ("envoy.route.extra-domains", "shared.com"),
                ],
                INGRESS_ID,
            ),
        ]);

        let discovered = provider(registry).discover().await.unwrap();

        assert_eq!(discovered.clusters.len(), 1);
        assert_eq!(discovered.clusters[0].name, "serviceA");
        assert!(discovered.vhosts.get("a.com").is_some());
        assert!(discovered.vhosts.get("b.com").is_none());
    }

    #[tokio::test]
    async fn local_ingress_network_is_rejected() {
        let registry = MemoryRegistry::new();
        registry.add_network(NetworkDescriptor {
            id: INGRESS_ID.to_string(),
            name: "edge".to_string(),
            scope: "local".to_string(),
        });

        let err = provider(registry).discover().await.unwrap_err();
        assert!(err.to_string().contains("not scoped for the entire cluster"));
    }

    #[tokio::test]
    async fn registry_failure_fails_the_pass() {
        let registry = registry();
        registry.fail_listing(Some("daemon unreachable"));

        let err = provider(registry).provide().await.unwrap_err();
        assert!(matches!(err, Error::Registry { .. }));
    }

    #[tokio::test]
    async fn acme_cluster_is_published_with_the_services() {
        let registry = registry();
        let provider = provider(registry)
            .with_acme_cluster(acme_cluster("control_plane_acme", "edgeplane", 8081).unwrap());

        let (clusters, listeners) = provider.provide().await.unwrap();

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "control_plane_acme");
        assert_eq!(clusters[0].type_url(), CLUSTER_TYPE_URL);
        assert_eq!(listeners.len(), 1);
    }
}
