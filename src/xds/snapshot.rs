//! Versioned xDS snapshots
//!
//! A snapshot carries every resource of one configuration group. It is
//! assembled once per discovery pass and never modified after publication.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use prost::Message;

use crate::xds::filter_chain::tls_context_of;
use crate::xds::resources::{BuiltResource, CLUSTER_TYPE_URL, LISTENER_TYPE_URL, SECRET_TYPE_URL};
use crate::{Error, Result};

/// The single configuration group every proxy belongs to
pub const EDGE_GROUP: &str = "edge";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub version: String,
    pub clusters: Vec<BuiltResource>,
    pub listeners: Vec<BuiltResource>,
    pub secrets: Vec<BuiltResource>,
}

impl Snapshot {
    pub fn new(
        version: impl Into<String>,
        clusters: Vec<BuiltResource>,
        listeners: Vec<BuiltResource>,
        secrets: Vec<BuiltResource>,
    ) -> Self {
        Self { version: version.into(), clusters, listeners, secrets }
    }

    /// Resources of one type, empty for types the snapshot does not carry
    pub fn resources(&self, type_url: &str) -> &[BuiltResource] {
        match type_url {
            CLUSTER_TYPE_URL => &self.clusters,
            LISTENER_TYPE_URL => &self.listeners,
            SECRET_TYPE_URL => &self.secrets,
            _ => &[],
        }
    }

    /// Every secret a listener references through SDS must be part of the
    /// snapshot, otherwise Envoy would wait for it forever.
    pub fn consistent(&self) -> Result<()> {
        let secrets: HashSet<&str> = self.secrets.iter().map(|s| s.name.as_str()).collect();

        for resource in &self.listeners {
            let listener = Listener::decode(resource.resource.value.as_slice()).map_err(|e| {
                Error::inconsistent(format!("listener {} cannot be decoded: {}", resource.name, e))
            })?;

            for chain in &listener.filter_chains {
                let Some(context) = tls_context_of(chain) else { continue };
                let referenced = context
                    .common_tls_context
                    .iter()
                    .flat_map(|common| &common.tls_certificate_sds_secret_configs);

                for secret in referenced {
                    if !secrets.contains(secret.name.as_str()) {
                        return Err(Error::inconsistent(format!(
                            "listener {} references missing secret {}",
                            listener.name, secret.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn resource_count(&self) -> usize {
        self.clusters.len() + self.listeners.len() + self.secrets.len()
    }
}

/// Snapshot version for a publication at `now`
pub fn snapshot_version(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Destination of published snapshots
pub trait SnapshotCache: Send + Sync {
    fn set_snapshot(&self, group: &str, snapshot: Snapshot) -> Result<()>;
}

/// Maps a connecting node to its configuration group
pub trait NodeHash: Send + Sync {
    fn id(&self, node: Option<&Node>) -> String;
}

/// Puts every identified node into [`EDGE_GROUP`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticHash;

impl NodeHash for StaticHash {
    fn id(&self, node: Option<&Node>) -> String {
        match node {
            Some(_) => EDGE_GROUP.to_string(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::filter_chain::FilterChainBuilder;
    use crate::xds::listener::ListenerBuilder;
    use envoy_types::pb::envoy::config::route::v3::VirtualHost;
    use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
        SdsSecretConfig, Secret,
    };

    fn tls_listener(secret: &str) -> BuiltResource {
        let mut builder = ListenerBuilder::new("https_listener", 443).with_tls_inspector();
        builder.add_filter_chain(
            FilterChainBuilder::new("a.com")
                .enable_tls(
                    vec!["a.com".to_string()],
                    SdsSecretConfig { name: secret.to_string(), sds_config: None },
                )
                .with_vhost(VirtualHost {
                    name: "a.com".to_string(),
                    domains: vec!["a.com".to_string()],
                    ..Default::default()
                }),
        );
        let listener = builder.build().unwrap();
        BuiltResource::new(listener.name.clone(), LISTENER_TYPE_URL, &listener)
    }

    fn secret(name: &str) -> BuiltResource {
        BuiltResource::new(name, SECRET_TYPE_URL, &Secret { name: name.to_string(), r#type: None })
    }

    #[test]
    fn referenced_secret_must_exist() {
        let snapshot = Snapshot::new("v1", vec![], vec![tls_listener("downstream_tls_a.com")], vec![]);
        let err = snapshot.consistent().unwrap_err();
        assert!(err.to_string().contains("missing secret downstream_tls_a.com"));

        let snapshot = Snapshot::new(
            "v1",
            vec![],
            vec![tls_listener("downstream_tls_a.com")],
            vec![secret("downstream_tls_a.com")],
        );
        assert!(snapshot.consistent().is_ok());
        assert_eq!(snapshot.resource_count(), 2);
        assert_eq!(snapshot.resources(SECRET_TYPE_URL).len(), 1);
    }

    #[test]
    fn empty_snapshot_is_consistent() {
        assert!(Snapshot::default().consistent().is_ok());
    }

    #[test]
    fn version_has_nanosecond_precision() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(snapshot_version(now), "2024-05-01T10:00:00.123456789Z");
    }

    #[test]
    fn static_hash_groups_identified_nodes() {
        let node = Node { id: "envoy-1".to_string(), ..Default::default() };
        assert_eq!(StaticHash.id(Some(&node)), EDGE_GROUP);
        assert_eq!(StaticHash.id(None), "");
    }
}
