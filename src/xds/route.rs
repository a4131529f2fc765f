//! Virtual host aggregation
//!
//! Every exposed service contributes one route to the virtual host of its
//! primary domain. [`VhostCollection`] merges those routes and guarantees that
//! a domain is served by exactly one virtual host.

use std::collections::{BTreeMap, HashMap};

use envoy_types::pb::envoy::config::route::v3::{
    redirect_action::SchemeRewriteSpecifier, route::Action, route_action::ClusterSpecifier,
    route_match::PathSpecifier, RedirectAction, Route, RouteAction, RouteMatch, VirtualHost,
};

use crate::domain::ServiceIntent;
use crate::xds::resources::{proto_duration, seconds};
use crate::{Error, Result};

/// Idle timeout applied to every service route
const ROUTE_IDLE_TIMEOUT_SECONDS: i64 = 15;

pub const HTTPS_REDIRECT_ROUTE: &str = "https_redirect";
pub const ACME_HTTP01_ROUTE: &str = "acme_http01_route";
pub const ACME_PATH_PREFIX: &str = "/.well-known";

/// Virtual hosts of one discovery pass, keyed by primary domain
#[derive(Debug, Default, Clone)]
pub struct VhostCollection {
    vhosts: BTreeMap<String, VirtualHost>,
    // domain -> primary domain of the owning vhost
    owners: HashMap<String, String>,
}

impl VhostCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the route of `cluster` to the vhost of the intent's primary domain.
    ///
    /// All domains are checked before anything is modified, so a rejected
    /// service leaves the collection untouched.
    pub fn add_service(&mut self, cluster: &str, intent: &ServiceIntent) -> Result<()> {
        let primary = intent.route.domain.as_str();

        if !self.vhosts.contains_key(primary) && self.owners.contains_key(primary) {
            return Err(domain_conflict(primary));
        }

        let mut new_domains: Vec<&str> = Vec::new();
        for extra in &intent.route.extra_domains {
            if extra == primary || new_domains.contains(&extra.as_str()) {
                continue;
            }

            match self.owners.get(extra) {
                Some(owner) if owner != primary => return Err(domain_conflict(extra)),
                Some(_) => continue,
                None => new_domains.push(extra),
            }
        }

        let vhost = self.vhosts.entry(primary.to_string()).or_insert_with(|| VirtualHost {
            name: primary.to_string(),
            domains: vec![primary.to_string()],
            ..Default::default()
        });
        self.owners.insert(primary.to_string(), primary.to_string());

        // the catch-all route has to stay last
        let route = service_route(cluster, intent);
        if intent.route.path_prefix == "/" {
            vhost.routes.push(route);
        } else {
            vhost.routes.insert(0, route);
        }

        for domain in new_domains {
            vhost.domains.push(domain.to_string());
            self.owners.insert(domain.to_string(), primary.to_string());
        }

        Ok(())
    }

    pub fn get(&self, primary_domain: &str) -> Option<&VirtualHost> {
        self.vhosts.get(primary_domain)
    }

    /// Vhosts ordered by primary domain
    pub fn vhosts(&self) -> impl Iterator<Item = &VirtualHost> {
        self.vhosts.values()
    }

    pub fn into_vhosts(self) -> Vec<VirtualHost> {
        self.vhosts.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.vhosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vhosts.is_empty()
    }

    /// Primary domain of the vhost serving `domain`, if any
    pub fn owner_of(&self, domain: &str) -> Option<&str> {
        self.owners.get(domain).map(String::as_str)
    }
}

fn domain_conflict(domain: &str) -> Error {
    Error::conflict(format!("domain {} is already used in another vhost", domain), "vhost")
}

fn prefix_match(prefix: &str) -> RouteMatch {
    RouteMatch {
        path_specifier: Some(PathSpecifier::Prefix(prefix.to_string())),
        ..Default::default()
    }
}

fn service_route(cluster: &str, intent: &ServiceIntent) -> Route {
    Route {
        name: format!("{}_route", cluster),
        r#match: Some(prefix_match(&intent.route.path_prefix)),
        action: Some(Action::Route(RouteAction {
            cluster_specifier: Some(ClusterSpecifier::Cluster(cluster.to_string())),
            idle_timeout: Some(seconds(ROUTE_IDLE_TIMEOUT_SECONDS)),
            timeout: Some(proto_duration(intent.endpoint.request_timeout)),
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// Same domains as `vhost`, but every request is redirected to https.
/// Prefix redirects keep the path, so ACME challenges still resolve.
pub fn https_redirect_vhost(vhost: &VirtualHost) -> VirtualHost {
    VirtualHost {
        name: vhost.name.clone(),
        domains: vhost.domains.clone(),
        routes: vec![Route {
            name: HTTPS_REDIRECT_ROUTE.to_string(),
            r#match: Some(prefix_match("/")),
            action: Some(Action::Redirect(RedirectAction {
                scheme_rewrite_specifier: Some(SchemeRewriteSpecifier::HttpsRedirect(true)),
                ..Default::default()
            })),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Route sending `/.well-known` traffic to the HTTP-01 challenge responder
pub fn acme_challenge_route(acme_cluster: &str) -> Route {
    Route {
        name: ACME_HTTP01_ROUTE.to_string(),
        r#match: Some(prefix_match(ACME_PATH_PREFIX)),
        action: Some(Action::Route(RouteAction {
            cluster_specifier: Some(ClusterSpecifier::Cluster(acme_cluster.to_string())),
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// Copy of `vhost` that also matches `domain:port` host headers
pub fn with_port_aliases(vhost: &VirtualHost, port: u16) -> VirtualHost {
    let mut aliased = vhost.clone();
    let aliases: Vec<String> = vhost
        .domains
        .iter()
        .filter(|domain| !domain.contains(':'))
        .map(|domain| format!("{}:{}", domain, port))
        .filter(|alias| !vhost.domains.contains(alias))
        .collect();
    aliased.domains.extend(aliases);
    aliased
}

/// Path prefix of a route, empty for other match kinds
pub fn route_prefix(route: &Route) -> &str {
    match route.r#match.as_ref().and_then(|m| m.path_specifier.as_ref()) {
        Some(PathSpecifier::Prefix(prefix)) => prefix,
        _ => "",
    }
}
