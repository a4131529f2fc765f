//! Upstream clusters
//!
//! Every exposed service becomes a STRICT_DNS cluster resolving the swarm task
//! records (`tasks.<service>`), so Envoy balances over the task IPs directly
//! instead of going through the service VIP.

use envoy_types::pb::envoy::config::{
    cluster::v3::{
        cluster::{ClusterDiscoveryType, DiscoveryType},
        Cluster, UpstreamConnectionOptions,
    },
    core::v3::{
        address::Address as AddressType,
        socket_address::{PortSpecifier, Protocol},
        Address, SocketAddress, TcpKeepalive,
    },
    endpoint::v3::{
        lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint,
        LocalityLbEndpoints,
    },
};
use once_cell::sync::Lazy;
use regex::Regex;
use validator::Validate;

use crate::domain::{EndpointProtocol, ServiceIntent};
use crate::xds::resources::{seconds, u32_value};
use crate::{Error, Result};

const CONNECT_TIMEOUT_SECONDS: i64 = 2;
const DNS_REFRESH_SECONDS: i64 = 4;
const KEEPALIVE_PROBES: u32 = 3;
const KEEPALIVE_TIME_SECONDS: u32 = 3600;
const KEEPALIVE_INTERVAL_SECONDS: u32 = 60;

/// Swarm service names and Envoy cluster names share this shape
pub static CLUSTER_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("cluster name pattern is valid")
});

/// Upstream of one cluster before conversion to Envoy types
#[derive(Debug, Clone, Validate)]
pub struct UpstreamSpec {
    #[validate(length(min = 1, max = 255, message = "Cluster name must be 1-255 characters"))]
    #[validate(regex(path = *CLUSTER_NAME_REGEX, message = "Cluster name must be a valid identifier"))]
    pub name: String,

    #[validate(length(min = 1, message = "Upstream address cannot be empty"))]
    pub address: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u32,

    pub protocol: EndpointProtocol,
}

impl UpstreamSpec {
    /// Upstream reaching the tasks of a swarm service
    pub fn for_service(name: &str, intent: &ServiceIntent) -> Self {
        Self {
            name: name.to_string(),
            address: format!("tasks.{}", name),
            port: intent.endpoint.port,
            protocol: intent.endpoint.protocol,
        }
    }

    pub fn to_envoy_cluster(&self) -> Result<Cluster> {
        self.validate().map_err(|e| {
            Error::validation_field(format!("Cluster validation failed: {}", e), "cluster")
        })?;

        Ok(Cluster {
            name: self.name.clone(),
            connect_timeout: Some(seconds(CONNECT_TIMEOUT_SECONDS)),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(
                DiscoveryType::StrictDns as i32,
            )),
            respect_dns_ttl: false,
            dns_refresh_rate: Some(seconds(DNS_REFRESH_SECONDS)),
            load_assignment: Some(self.load_assignment()),
            upstream_connection_options: Some(UpstreamConnectionOptions {
                tcp_keepalive: Some(TcpKeepalive {
                    keepalive_probes: Some(u32_value(KEEPALIVE_PROBES)),
                    keepalive_time: Some(u32_value(KEEPALIVE_TIME_SECONDS)),
                    keepalive_interval: Some(u32_value(KEEPALIVE_INTERVAL_SECONDS)),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn load_assignment(&self) -> ClusterLoadAssignment {
        let protocol = match self.protocol {
            EndpointProtocol::Tcp => Protocol::Tcp,
            EndpointProtocol::Udp => Protocol::Udp,
        };

        let socket_address = SocketAddress {
            protocol: protocol as i32,
            address: self.address.clone(),
            port_specifier: Some(PortSpecifier::PortValue(self.port)),
            ..Default::default()
        };

        let endpoint = Endpoint {
            address: Some(Address { address: Some(AddressType::SocketAddress(socket_address)) }),
            ..Default::default()
        };

        ClusterLoadAssignment {
            cluster_name: self.name.clone(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    host_identifier: Some(HostIdentifier::Endpoint(endpoint)),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

/// Cluster for a swarm service
pub fn service_cluster(name: &str, intent: &ServiceIntent) -> Result<Cluster> {
    UpstreamSpec::for_service(name, intent).to_envoy_cluster()
}

/// Cluster pointing at the HTTP-01 challenge responder
pub fn acme_cluster(name: &str, address: &str, port: u16) -> Result<Cluster> {
    UpstreamSpec {
        name: name.to_string(),
        address: address.to_string(),
        port: u32::from(port),
        protocol: EndpointProtocol::Tcp,
    }
    .to_envoy_cluster()
}

/// Socket address of the first endpoint, if any
pub fn first_endpoint(cluster: &Cluster) -> Option<&SocketAddress> {
    let endpoint = cluster.load_assignment.as_ref()?.endpoints.first()?.lb_endpoints.first()?;
    match endpoint.host_identifier.as_ref()? {
        HostIdentifier::Endpoint(endpoint) => match endpoint.address.as_ref()?.address.as_ref()? {
            AddressType::SocketAddress(socket) => Some(socket),
            _ => None,
        },
        _ => None,
    }
}
