//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use edgeplane::acme::{Acme, CertificateBundle, CertificateLifecycle};
use edgeplane::discovery::{SnapshotManager, SwarmProvider};
use edgeplane::registry::{
    MemoryRegistry, NetworkDescriptor, ServiceDescriptor, VirtualIp, SWARM_SCOPE,
};
use edgeplane::storage::{CertificateStore, FileCertificateStore, MemoryStorage};
use edgeplane::xds::{CertificateSecretsProvider, ListenerProvider, XdsState};
use edgeplane::Result;
use rcgen::{CertificateParams, KeyPair};
use tracing::Span;

pub const INGRESS_NETWORK: &str = "edge-traffic";
pub const INGRESS_ID: &str = "ingress-net-id";
pub const ACME_CLUSTER: &str = "control_plane_acme";

/// Self-signed PEM chain and key covering `domains`
pub fn self_signed(domains: &[&str], days_valid: i64) -> (String, String) {
    let mut params =
        CertificateParams::new(domains.iter().map(|d| d.to_string()).collect::<Vec<_>>()).unwrap();
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(days_valid);

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// Certificate authority that signs everything itself
pub struct SelfSignedAcme;

#[async_trait]
impl Acme for SelfSignedAcme {
    async fn obtain(&self, domains: &[String]) -> Result<CertificateBundle> {
        let names: Vec<&str> = domains.iter().map(String::as_str).collect();
        let (chain, key) = self_signed(&names, 90);
        Ok(CertificateBundle { chain: chain.into_bytes(), key: key.into_bytes() })
    }
}

/// Registry with the ingress network already present
pub fn registry() -> MemoryRegistry {
    let registry = MemoryRegistry::new();
    registry.add_network(NetworkDescriptor {
        id: INGRESS_ID.to_string(),
        name: INGRESS_NETWORK.to_string(),
        scope: SWARM_SCOPE.to_string(),
    });
    registry
}

/// Service attached to the ingress network
pub fn service(name: &str, labels: &[(&str, &str)]) -> ServiceDescriptor {
    ServiceDescriptor {
        id: format!("{}-id", name),
        name: name.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        virtual_ips: vec![VirtualIp {
            network_id: INGRESS_ID.to_string(),
            addr: "10.0.9.4/24".to_string(),
        }],
    }
}

/// The discovery pipeline on in-memory collaborators
pub struct Pipeline {
    pub registry: MemoryRegistry,
    pub store: Arc<FileCertificateStore>,
    pub lifecycle: Arc<CertificateLifecycle>,
    pub state: Arc<XdsState>,
    pub manager: SnapshotManager,
}

impl Pipeline {
    pub fn new() -> Self {
        let registry = registry();
        let store = Arc::new(FileCertificateStore::new(Arc::new(MemoryStorage::new())));
        let lifecycle = Arc::new(CertificateLifecycle::new(
            Arc::new(SelfSignedAcme),
            store.clone(),
            ACME_CLUSTER,
            Span::none(),
        ));
        let secrets =
            Arc::new(CertificateSecretsProvider::new("control_plane", store.clone(), Span::none()));
        let listeners = ListenerProvider::new(secrets.clone(), Some(lifecycle.clone()), Span::none());
        let provider =
            SwarmProvider::new(Arc::new(registry.clone()), INGRESS_NETWORK, listeners, Span::none());
        let state = Arc::new(XdsState::new());
        let manager =
            SnapshotManager::new(Arc::new(provider), secrets, state.clone(), Span::none());

        Self { registry, store, lifecycle, state, manager }
    }

    pub async fn store_certificate(&self, primary: &str, domains: &[&str], days_valid: i64) {
        let (chain, key) = self_signed(domains, days_valid);
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        self.store.put(primary, &domains, chain.as_bytes(), key.as_bytes()).await.unwrap();
    }
}
