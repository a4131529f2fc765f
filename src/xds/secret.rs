//! TLS secrets for SDS
//!
//! The listener builder asks for an SDS reference per TLS vhost through
//! [`CertificateSecretsProvider::certificate_config`]; the same pass later
//! turns exactly those references into `Secret` resources.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use envoy_types::pb::envoy::config::core::v3::{
    api_config_source::ApiType, config_source::ConfigSourceSpecifier, data_source::Specifier,
    grpc_service::{EnvoyGrpc, TargetSpecifier}, ApiConfigSource, ApiVersion, ConfigSource,
    DataSource, GrpcService,
};
use envoy_types::pb::envoy::config::route::v3::VirtualHost;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, SdsSecretConfig, Secret, TlsCertificate,
};
use tracing::{debug, warn, Instrument, Span};

use crate::discovery::SecretsProvider;
use crate::storage::CertificateStore;
use crate::utils::certificates::is_cert_usable;
use crate::xds::resources::{BuiltResource, SECRET_TYPE_URL};
use crate::Result;

pub const SECRET_NAME_PREFIX: &str = "downstream_tls_";

/// SDS secret name of a vhost's certificate
pub fn secret_name(vhost: &VirtualHost) -> String {
    format!("{}{}", SECRET_NAME_PREFIX, vhost.name.to_lowercase())
}

/// Config source pointing Envoy at this control plane for SDS
pub fn sds_config_source(control_plane_cluster: &str) -> ConfigSource {
    ConfigSource {
        resource_api_version: ApiVersion::V3 as i32,
        config_source_specifier: Some(ConfigSourceSpecifier::ApiConfigSource(ApiConfigSource {
            api_type: ApiType::Grpc as i32,
            transport_api_version: ApiVersion::V3 as i32,
            grpc_services: vec![GrpcService {
                target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
                    cluster_name: control_plane_cluster.to_string(),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        })),
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
struct RequestedCertificate {
    primary: String,
    domains: Vec<String>,
}

/// Serves certificates from the store for the secrets listeners reference
pub struct CertificateSecretsProvider {
    config_source: ConfigSource,
    store: Arc<dyn CertificateStore>,
    requested: Mutex<BTreeMap<String, RequestedCertificate>>,
    span: Span,
}

impl CertificateSecretsProvider {
    pub fn new(control_plane_cluster: &str, store: Arc<dyn CertificateStore>, span: Span) -> Self {
        Self {
            config_source: sds_config_source(control_plane_cluster),
            store,
            requested: Mutex::new(BTreeMap::new()),
            span,
        }
    }

    /// Whether the store holds an unexpired certificate for the vhost's domains
    pub async fn has_valid_certificate(&self, vhost: &VirtualHost) -> bool {
        match self.store.get(&vhost.name, &vhost.domains).await {
            Ok(bundle) => is_cert_usable(&bundle.chain, &bundle.key, Utc::now()),
            Err(e) => {
                debug!(parent: &self.span, vhost = %vhost.name, error = %e, "No stored certificate");
                false
            }
        }
    }

    /// SDS reference for the vhost's certificate. The secret is delivered by
    /// the next [`SecretsProvider::provide`] call.
    pub fn certificate_config(&self, vhost: &VirtualHost) -> SdsSecretConfig {
        let name = secret_name(vhost);
        self.requested.lock().expect("requested secrets lock poisoned").insert(
            name.clone(),
            RequestedCertificate { primary: vhost.name.clone(), domains: vhost.domains.clone() },
        );

        SdsSecretConfig { name, sds_config: Some(self.config_source.clone()) }
    }

    /// Forget references left behind by a pass that never reached [`SecretsProvider::provide`]
    pub fn clear_requests(&self) {
        self.requested.lock().expect("requested secrets lock poisoned").clear();
    }

    fn take_requested(&self) -> BTreeMap<String, RequestedCertificate> {
        std::mem::take(&mut *self.requested.lock().expect("requested secrets lock poisoned"))
    }
}

#[async_trait]
impl SecretsProvider for CertificateSecretsProvider {
    async fn provide(&self) -> Result<Vec<BuiltResource>> {
        let requested = self.take_requested();

        async {
            let mut secrets = Vec::with_capacity(requested.len());
            for (name, certificate) in requested {
                let bundle = match self.store.get(&certificate.primary, &certificate.domains).await
                {
                    Ok(bundle) => bundle,
                    Err(e) => {
                        warn!(secret = %name, error = %e, "promised certificate for {} is suddenly gone", name);
                        continue;
                    }
                };

                let secret = Secret {
                    name: name.clone(),
                    r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
                        certificate_chain: Some(inline_bytes(bundle.chain)),
                        private_key: Some(inline_bytes(bundle.key)),
                        ..Default::default()
                    })),
                };
                secrets.push(BuiltResource::new(name, SECRET_TYPE_URL, &secret));
            }

            debug!(count = secrets.len(), "Provided TLS secrets");
            Ok(secrets)
        }
        .instrument(self.span.clone())
        .await
    }
}

fn inline_bytes(bytes: Vec<u8>) -> DataSource {
    DataSource { specifier: Some(Specifier::InlineBytes(bytes)), ..Default::default() }
}
