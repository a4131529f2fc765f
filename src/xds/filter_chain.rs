//! Filter chains serving virtual hosts
//!
//! A chain carries one HTTP connection manager with an inline route
//! configuration. TLS chains additionally match on SNI and terminate TLS with
//! a certificate delivered over SDS.

use envoy_types::pb::envoy::config::core::v3::{
    http_protocol_options::HeadersWithUnderscoresAction,
    transport_socket::ConfigType as TransportSocketConfigType, Http2ProtocolOptions,
    HttpProtocolOptions, TransportSocket,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter::ConfigType as FilterConfigType, Filter, FilterChain, FilterChainMatch,
};
use envoy_types::pb::envoy::config::route::v3::{RouteConfiguration, VirtualHost};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, DownstreamTlsContext, SdsSecretConfig,
};
use envoy_types::pb::google::protobuf::BoolValue;
use prost::Message;

use crate::xds::resources::{
    seconds, to_any, u32_value, DOWNSTREAM_TLS_CONTEXT_TYPE_URL, HTTP_CONNECTION_MANAGER_TYPE_URL,
    ROUTER_TYPE_URL,
};

pub const HTTP_CONNECTION_MANAGER_FILTER: &str = "envoy.filters.network.http_connection_manager";
pub const ROUTER_FILTER: &str = "envoy.filters.http.router";
pub const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

const IDLE_TIMEOUT_SECONDS: i64 = 3600;
const STREAM_IDLE_TIMEOUT_SECONDS: i64 = 300;
const REQUEST_TIMEOUT_SECONDS: i64 = 300;
const MAX_CONCURRENT_STREAMS: u32 = 100;
const INITIAL_STREAM_WINDOW_SIZE: u32 = 65_536;
const INITIAL_CONNECTION_WINDOW_SIZE: u32 = 1_048_576;

#[derive(Debug, Clone)]
struct TlsSettings {
    server_names: Vec<String>,
    secret: SdsSecretConfig,
}

/// Collects the vhosts of one filter chain
#[derive(Debug, Clone)]
pub struct FilterChainBuilder {
    name: String,
    tls: Option<TlsSettings>,
    vhosts: Vec<VirtualHost>,
}

impl FilterChainBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), tls: None, vhosts: Vec::new() }
    }

    /// Terminate TLS for `server_names` with the certificate behind `secret`
    pub fn enable_tls(mut self, server_names: Vec<String>, secret: SdsSecretConfig) -> Self {
        self.tls = Some(TlsSettings { server_names, secret });
        self
    }

    pub fn with_vhost(mut self, vhost: VirtualHost) -> Self {
        self.vhosts.push(vhost);
        self
    }

    pub fn add_vhost(&mut self, vhost: VirtualHost) {
        self.vhosts.push(vhost);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Name of the inline route configuration
    pub fn route_config_name(&self) -> String {
        let scheme = if self.is_tls() { "https" } else { "http" };
        format!("{}_{}_routes", self.name, scheme)
    }

    /// Build the chain. Without vhosts the chain has no connection manager.
    pub fn build(self) -> FilterChain {
        let mut filters = Vec::new();
        if !self.vhosts.is_empty() {
            filters.push(self.connection_manager());
        }

        let (filter_chain_match, transport_socket) = match self.tls {
            Some(tls) => (
                Some(FilterChainMatch { server_names: tls.server_names, ..Default::default() }),
                Some(tls_transport_socket(tls.secret)),
            ),
            None => (None, None),
        };

        FilterChain {
            name: self.name,
            filter_chain_match,
            filters,
            transport_socket,
            ..Default::default()
        }
    }

    fn connection_manager(&self) -> Filter {
        let route_config = RouteConfiguration {
            name: self.route_config_name(),
            virtual_hosts: self.vhosts.clone(),
            ..Default::default()
        };

        let router = HttpFilter {
            name: ROUTER_FILTER.to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(to_any(
                ROUTER_TYPE_URL,
                &Router::default(),
            ))),
            ..Default::default()
        };

        let hcm = HttpConnectionManager {
            codec_type: CodecType::Auto as i32,
            stat_prefix: self.name.clone(),
            route_specifier: Some(RouteSpecifier::RouteConfig(route_config)),
            http_filters: vec![router],
            use_remote_address: Some(BoolValue { value: true }),
            common_http_protocol_options: Some(HttpProtocolOptions {
                idle_timeout: Some(seconds(IDLE_TIMEOUT_SECONDS)),
                headers_with_underscores_action: HeadersWithUnderscoresAction::RejectRequest
                    as i32,
                ..Default::default()
            }),
            http2_protocol_options: Some(Http2ProtocolOptions {
                max_concurrent_streams: Some(u32_value(MAX_CONCURRENT_STREAMS)),
                initial_stream_window_size: Some(u32_value(INITIAL_STREAM_WINDOW_SIZE)),
                initial_connection_window_size: Some(u32_value(INITIAL_CONNECTION_WINDOW_SIZE)),
                ..Default::default()
            }),
            stream_idle_timeout: Some(seconds(STREAM_IDLE_TIMEOUT_SECONDS)),
            request_timeout: Some(seconds(REQUEST_TIMEOUT_SECONDS)),
            ..Default::default()
        };

        Filter {
            name: HTTP_CONNECTION_MANAGER_FILTER.to_string(),
            config_type: Some(FilterConfigType::TypedConfig(to_any(
                HTTP_CONNECTION_MANAGER_TYPE_URL,
                &hcm,
            ))),
        }
    }
}

fn tls_transport_socket(secret: SdsSecretConfig) -> TransportSocket {
    let context = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            tls_certificate_sds_secret_configs: vec![secret],
            ..Default::default()
        }),
        ..Default::default()
    };

    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(to_any(
            DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
            &context,
        ))),
    }
}

/// Decode the connection manager of a chain built by [`FilterChainBuilder`]
pub fn connection_manager_of(chain: &FilterChain) -> Option<HttpConnectionManager> {
    chain.filters.iter().find_map(|filter| match filter.config_type.as_ref()? {
        FilterConfigType::TypedConfig(any) if any.type_url == HTTP_CONNECTION_MANAGER_TYPE_URL => {
            HttpConnectionManager::decode(any.value.as_slice()).ok()
        }
        _ => None,
    })
}

/// Decode the downstream TLS context of a chain, if it terminates TLS
pub fn tls_context_of(chain: &FilterChain) -> Option<DownstreamTlsContext> {
    match chain.transport_socket.as_ref()?.config_type.as_ref()? {
        TransportSocketConfigType::TypedConfig(any)
            if any.type_url == DOWNSTREAM_TLS_CONTEXT_TYPE_URL =>
        {
            DownstreamTlsContext::decode(any.value.as_slice()).ok()
        }
        _ => None,
    }
}

/// Vhosts of the inline route configuration of a chain
pub fn vhosts_of(chain: &FilterChain) -> Vec<VirtualHost> {
    match connection_manager_of(chain).and_then(|hcm| hcm.route_specifier) {
        Some(RouteSpecifier::RouteConfig(config)) => config.virtual_hosts,
        _ => Vec::new(),
    }
}
