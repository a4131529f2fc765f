//! Domain layer
//!
//! Pure types describing what a Swarm service asks of the edge proxy. Nothing
//! here depends on Envoy protobufs or the Docker API.

pub mod service;

pub use service::{
    is_dns_name, parse_go_duration, EndpointIntent, EndpointProtocol, LabelError, RouteIntent,
    ServiceIntent, DEFAULT_REQUEST_TIMEOUT, WILDCARD_DOMAIN,
};
