//! Envoy resource wrappers and protobuf helpers shared by the builders.

use chrono::TimeDelta;
use envoy_types::pb::google::protobuf::{Any, Duration, UInt32Value};
use prost::Message;

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
pub const HTTP_CONNECTION_MANAGER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
pub const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
pub const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

/// Wrapper for a built Envoy resource along with its name.
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltResource {
    pub name: String,
    pub resource: Any,
}

impl BuiltResource {
    /// Encode `message` into an `Any` of the given type
    pub fn new<M: Message>(name: impl Into<String>, type_url: &str, message: &M) -> Self {
        Self { name: name.into(), resource: to_any(type_url, message) }
    }

    pub fn into_any(self) -> Any {
        self.resource
    }

    pub fn type_url(&self) -> &str {
        &self.resource.type_url
    }
}

pub(crate) fn to_any<M: Message>(type_url: &str, message: &M) -> Any {
    Any { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

pub(crate) fn seconds(seconds: i64) -> Duration {
    Duration { seconds, nanos: 0 }
}

pub(crate) fn proto_duration(delta: TimeDelta) -> Duration {
    Duration { seconds: delta.num_seconds(), nanos: delta.subsec_nanos() }
}

pub(crate) fn u32_value(value: u32) -> UInt32Value {
    UInt32Value { value }
}
