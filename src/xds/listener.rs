//! Edge listeners
//!
//! Plain HTTP traffic lands on `http_listener` (port 80), TLS traffic on
//! `https_listener` (port 443). Vhosts holding a valid certificate get their
//! own SNI matched filter chain on the TLS listener and an https redirect on
//! the plain one; everything else is served over plain HTTP, answering ACME
//! HTTP-01 challenges until a certificate is issued.

use std::collections::HashSet;
use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType,
    socket_address::{PortSpecifier, Protocol},
    Address, SocketAddress,
};
use envoy_types::pb::envoy::config::listener::v3::{
    listener_filter::ConfigType as ListenerFilterConfigType, Filter, FilterChain, Listener,
    ListenerFilter,
};
use envoy_types::pb::envoy::config::route::v3::VirtualHost;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use tracing::{debug, Instrument, Span};

use crate::acme::CertificateLifecycle;
use crate::domain::WILDCARD_DOMAIN;
use crate::xds::filter_chain::FilterChainBuilder;
use crate::xds::resources::{
    to_any, u32_value, BuiltResource, LISTENER_TYPE_URL, TLS_INSPECTOR_TYPE_URL,
};
use crate::xds::route::{https_redirect_vhost, with_port_aliases, VhostCollection};
use crate::xds::secret::CertificateSecretsProvider;
use crate::{Error, Result};

pub const HTTP_LISTENER: &str = "http_listener";
pub const HTTPS_LISTENER: &str = "https_listener";
pub const HTTP_FILTER_CHAIN: &str = "httpFilter";
pub const TLS_INSPECTOR_FILTER: &str = "envoy.filters.listener.tls_inspector";

const LISTEN_ADDRESS: &str = "0.0.0.0";
const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;
const PER_CONNECTION_BUFFER_LIMIT_BYTES: u32 = 32_768;

/// Assembles one listener out of filter chains
#[derive(Debug, Clone)]
pub struct ListenerBuilder {
    name: String,
    port: u16,
    tls_inspector: bool,
    chains: Vec<FilterChainBuilder>,
}

impl ListenerBuilder {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self { name: name.into(), port, tls_inspector: false, chains: Vec::new() }
    }

    /// Inspect the TLS client hello so chains can match on SNI
    pub fn with_tls_inspector(mut self) -> Self {
        self.tls_inspector = true;
        self
    }

    pub fn add_filter_chain(&mut self, chain: FilterChainBuilder) {
        self.chains.push(chain);
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Build and validate the listener
    pub fn build(self) -> Result<Listener> {
        let socket_address = SocketAddress {
            protocol: Protocol::Tcp as i32,
            address: LISTEN_ADDRESS.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(u32::from(self.port))),
            ..Default::default()
        };

        let listener_filters = if self.tls_inspector {
            vec![ListenerFilter {
                name: TLS_INSPECTOR_FILTER.to_string(),
                config_type: Some(ListenerFilterConfigType::TypedConfig(to_any(
                    TLS_INSPECTOR_TYPE_URL,
                    &TlsInspector::default(),
                ))),
                ..Default::default()
            }]
        } else {
            Vec::new()
        };

        let listener = Listener {
            name: self.name,
            address: Some(Address { address: Some(AddressType::SocketAddress(socket_address)) }),
            filter_chains: self.chains.into_iter().map(FilterChainBuilder::build).collect(),
            listener_filters,
            per_connection_buffer_limit_bytes: Some(u32_value(PER_CONNECTION_BUFFER_LIMIT_BYTES)),
            ..Default::default()
        };

        validate_listener(&listener)?;
        Ok(listener)
    }
}

/// Structural checks Envoy would otherwise reject the listener for
pub fn validate_listener(listener: &Listener) -> Result<()> {
    if listener.name.is_empty() {
        return Err(Error::validation_field("Listener name cannot be empty", "name"));
    }

    match listener.address.as_ref().and_then(|a| a.address.as_ref()) {
        Some(AddressType::SocketAddress(socket)) if !socket.address.is_empty() => {}
        _ => {
            return Err(Error::validation_field(
                format!("Listener {} requires a socket address", listener.name),
                "address",
            ))
        }
    }

    if listener.filter_chains.is_empty() {
        return Err(Error::validation_field(
            format!("Listener {} requires at least one filter chain", listener.name),
            "filter_chains",
        ));
    }

    let mut chain_names = HashSet::new();
    for chain in &listener.filter_chains {
        if !chain_names.insert(chain.name.as_str()) {
            return Err(Error::validation_field(
                format!("Listener {} has duplicate filter chain {}", listener.name, chain.name),
                "filter_chains",
            ));
        }
        validate_filter_chain(chain)?;
    }

    Ok(())
}

fn validate_filter_chain(chain: &FilterChain) -> Result<()> {
    chain.filters.iter().try_for_each(|filter| validate_filter(chain, filter))
}

fn validate_filter(chain: &FilterChain, filter: &Filter) -> Result<()> {
    if filter.name.is_empty() {
        return Err(Error::validation_field(
            format!("Filter in chain {} has no name", chain.name),
            "filters",
        ));
    }
    if filter.config_type.is_none() {
        return Err(Error::validation_field(
            format!("Filter {} in chain {} requires a typed config", filter.name, chain.name),
            "filters",
        ));
    }
    Ok(())
}

/// Listeners of one discovery pass
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSet {
    pub http: Listener,
    pub https: Option<Listener>,
}

impl ListenerSet {
    pub fn listeners(&self) -> impl Iterator<Item = &Listener> {
        std::iter::once(&self.http).chain(self.https.as_ref())
    }

    pub fn into_resources(self) -> Vec<BuiltResource> {
        std::iter::once(self.http)
            .chain(self.https)
            .map(|listener| BuiltResource::new(listener.name.clone(), LISTENER_TYPE_URL, &listener))
            .collect()
    }
}

/// Turns the vhosts of a pass into listeners, consulting certificate state
pub struct ListenerProvider {
    secrets: Arc<CertificateSecretsProvider>,
    lifecycle: Option<Arc<CertificateLifecycle>>,
    span: Span,
}

impl ListenerProvider {
    pub fn new(
        secrets: Arc<CertificateSecretsProvider>,
        lifecycle: Option<Arc<CertificateLifecycle>>,
        span: Span,
    ) -> Self {
        Self { secrets, lifecycle, span }
    }

    pub async fn provide_listeners(&self, vhosts: &VhostCollection) -> Result<ListenerSet> {
        self.secrets.clear_requests();

        async {
            let mut http_chain = FilterChainBuilder::new(HTTP_FILTER_CHAIN);
            let mut https = ListenerBuilder::new(HTTPS_LISTENER, HTTPS_PORT).with_tls_inspector();

            for vhost in vhosts.vhosts() {
                let has_certificate = self.secrets.has_valid_certificate(vhost).await;
                let vhost = self.prepare_for_issuing(vhost, has_certificate);

                if has_certificate {
                    if let Some(lifecycle) = &self.lifecycle {
                        lifecycle.enable_auto_renewal(&vhost);
                    }
                    http_chain.add_vhost(https_redirect_vhost(&vhost));
                    https.add_filter_chain(self.tls_chain(vhost));
                } else if self.is_issuing(&vhost) {
                    debug!(vhost = %vhost.name, "Serving vhost over plain HTTP until issued");
                    http_chain.add_vhost(with_port_aliases(&vhost, HTTP_PORT));
                } else {
                    debug!(vhost = %vhost.name, "Serving vhost over plain HTTP");
                    http_chain.add_vhost(vhost);
                }
            }

            let mut http = ListenerBuilder::new(HTTP_LISTENER, HTTP_PORT);
            http.add_filter_chain(http_chain);

            let https = if https.chain_count() > 0 { Some(https.build()?) } else { None };
            let set = ListenerSet { http: http.build()?, https };

            debug!(
                tls_chains = set.https.as_ref().map_or(0, |l| l.filter_chains.len()),
                "Built listeners"
            );
            Ok(set)
        }
        .instrument(self.span.clone())
        .await
    }

    fn prepare_for_issuing(&self, vhost: &VirtualHost, has_certificate: bool) -> VirtualHost {
        match &self.lifecycle {
            // HTTP-01 cannot validate the catch-all host
            _ if vhost.name == WILDCARD_DOMAIN => vhost.clone(),
            Some(lifecycle) if !has_certificate || lifecycle.is_scheduled_for_issuing(vhost) => {
                lifecycle.prepare_vhost_for_issuing(vhost)
            }
            _ => vhost.clone(),
        }
    }

    fn is_issuing(&self, vhost: &VirtualHost) -> bool {
        self.lifecycle.as_ref().is_some_and(|lifecycle| lifecycle.is_scheduled_for_issuing(vhost))
    }

    fn tls_chain(&self, vhost: VirtualHost) -> FilterChainBuilder {
        debug!(vhost = %vhost.name, "Serving vhost over TLS");
        let secret = self.secrets.certificate_config(&vhost);
        FilterChainBuilder::new(vhost.name.clone())
            .enable_tls(vhost.domains.clone(), secret)
            .with_vhost(vhost)
    }
}
