//! Discovery passes from registry contents to published snapshots

mod common;

use common::{service, Pipeline, ACME_CLUSTER};
use edgeplane::discovery::UpdateReason;
use edgeplane::xds::filter_chain::{tls_context_of, vhosts_of};
use edgeplane::xds::listener::{HTTPS_LISTENER, HTTP_LISTENER};
use edgeplane::xds::route::{route_prefix, ACME_HTTP01_ROUTE, HTTPS_REDIRECT_ROUTE};
use edgeplane::xds::{Snapshot, EDGE_GROUP};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::{route::Action, route_action::ClusterSpecifier};
use prost::Message;

fn listener(snapshot: &Snapshot, name: &str) -> Option<Listener> {
    snapshot
        .listeners
        .iter()
        .find(|resource| resource.name == name)
        .map(|resource| Listener::decode(resource.resource.value.as_slice()).unwrap())
}

fn cluster_names(snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .clusters
        .iter()
        .map(|resource| Cluster::decode(resource.resource.value.as_slice()).unwrap().name)
        .collect()
}

#[tokio::test]
async fn uncertified_service_is_served_over_http_and_queued_for_issuing() {
    let pipeline = Pipeline::new();
    pipeline.registry.set_services(vec![service(
        "web",
        &[("envoy.endpoint.port", "8080"), ("envoy.route.domain", "example.com")],
    )]);

    let snapshot = pipeline.manager.run_pass(UpdateReason::InitialDiscovery).await.unwrap();

    assert_eq!(cluster_names(&snapshot), vec!["web"]);
    assert!(listener(&snapshot, HTTPS_LISTENER).is_none());
    assert!(snapshot.secrets.is_empty());

    let http = listener(&snapshot, HTTP_LISTENER).unwrap();
    assert_eq!(http.filter_chains.len(), 1);
    let vhosts = vhosts_of(&http.filter_chains[0]);
    assert_eq!(vhosts.len(), 1);
    assert_eq!(vhosts[0].domains, vec!["example.com", "example.com:80"]);

    let prefixes: Vec<&str> = vhosts[0].routes.iter().map(route_prefix).collect();
    assert_eq!(prefixes, vec!["/.well-known", "/"]);
    assert_eq!(vhosts[0].routes[0].name, ACME_HTTP01_ROUTE);

    let backlog = pipeline.lifecycle.backlog();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog["example.com"], vec!["example.com"]);

    let published = pipeline.state.snapshot(EDGE_GROUP).unwrap();
    assert_eq!(published.version, snapshot.version);
}

#[tokio::test]
async fn services_sharing_a_domain_are_merged_with_the_catch_all_last() {
    let pipeline = Pipeline::new();
    pipeline.registry.set_services(vec![
        service(
            "frontend",
            &[("envoy.endpoint.port", "80"), ("envoy.route.domain", "example.com")],
        ),
        service(
            "backend",
            &[
                ("envoy.endpoint.port", "8080"),
                ("envoy.route.domain", "example.com"),
                ("envoy.route.path", "/api"),
            ],
        ),
    ]);

    let snapshot = pipeline.manager.run_pass(UpdateReason::ServiceChanged).await.unwrap();

    let mut clusters = cluster_names(&snapshot);
    clusters.sort();
    assert_eq!(clusters, vec!["backend", "frontend"]);

    let http = listener(&snapshot, HTTP_LISTENER).unwrap();
    let vhosts = vhosts_of(&http.filter_chains[0]);
    assert_eq!(vhosts.len(), 1);
    let prefixes: Vec<&str> = vhosts[0].routes.iter().map(route_prefix).collect();
    assert_eq!(prefixes, vec!["/.well-known", "/api", "/"]);
}

#[tokio::test]
async fn domain_collision_skips_the_later_service() {
    let pipeline = Pipeline::new();
    pipeline.registry.set_services(vec![
        service(
            "serviceA",
            &[
                ("envoy.endpoint.port", "80"),
                ("envoy.route.domain", "a.com"),
                ("envoy.route.extra-domains", "shared.com"),
            ],
        ),
        service(
            "serviceB",
            &[
                ("envoy.endpoint.port", "80"),
                ("envoy.route.domain", "b.com"),
                ("envoy.route.extra-domains", "shared.com"),
            ],
        ),
    ]);

    let snapshot = pipeline.manager.run_pass(UpdateReason::ServiceChanged).await.unwrap();

    assert_eq!(cluster_names(&snapshot), vec!["serviceA"]);
    let http = listener(&snapshot, HTTP_LISTENER).unwrap();
    let vhosts = vhosts_of(&http.filter_chains[0]);
    assert_eq!(vhosts.len(), 1);
    assert_eq!(vhosts[0].name, "a.com");
    assert!(vhosts[0].domains.contains(&"shared.com".to_string()));
    assert!(!pipeline.lifecycle.backlog().contains_key("b.com"));
}

#[tokio::test]
async fn certified_service_gets_an_sni_chain_and_a_redirect() {
    let pipeline = Pipeline::new();
    pipeline.registry.set_services(vec![service(
        "web",
        &[("envoy.endpoint.port", "8080"), ("envoy.route.domain", "example.com")],
    )]);
    pipeline.store_certificate("example.com", &["example.com"], 60).await;

    let snapshot = pipeline.manager.run_pass(UpdateReason::CertificateIssued).await.unwrap();

    let https = listener(&snapshot, HTTPS_LISTENER).unwrap();
    assert_eq!(https.filter_chains.len(), 1);
    let chain = &https.filter_chains[0];
    assert_eq!(chain.filter_chain_match.as_ref().unwrap().server_names, vec!["example.com"]);
    let context = tls_context_of(chain).unwrap();
    let secret_names: Vec<_> = context
        .common_tls_context
        .unwrap()
        .tls_certificate_sds_secret_configs
        .into_iter()
        .map(|config| config.name)
        .collect();
    assert_eq!(secret_names, vec!["downstream_tls_example.com"]);

    let http = listener(&snapshot, HTTP_LISTENER).unwrap();
    let redirect = vhosts_of(&http.filter_chains[0]);
    assert_eq!(redirect[0].routes.len(), 1);
    assert_eq!(redirect[0].routes[0].name, HTTPS_REDIRECT_ROUTE);

    assert_eq!(snapshot.secrets.len(), 1);
    assert_eq!(snapshot.secrets[0].name, "downstream_tls_example.com");
    assert!(pipeline.lifecycle.backlog().is_empty());
    assert!(pipeline.lifecycle.renewals().contains_key("example.com"));
}

#[tokio::test]
async fn issued_certificate_moves_the_service_to_https() {
    let pipeline = Pipeline::new();
    pipeline.registry.set_services(vec![service(
        "web",
        &[
            ("envoy.endpoint.port", "8080"),
            ("envoy.route.domain", "example.com"),
            ("envoy.route.extra-domains", "www.example.com"),
        ],
    )]);

    let first = pipeline.manager.run_pass(UpdateReason::InitialDiscovery).await.unwrap();
    assert!(listener(&first, HTTPS_LISTENER).is_none());

    assert!(pipeline.lifecycle.issue_certificates().await.unwrap());
    assert!(pipeline.lifecycle.backlog().is_empty());

    let second = pipeline.manager.run_pass(UpdateReason::CertificateIssued).await.unwrap();
    let https = listener(&second, HTTPS_LISTENER).unwrap();
    assert_eq!(
        https.filter_chains[0].filter_chain_match.as_ref().unwrap().server_names,
        vec!["example.com", "www.example.com"]
    );
    assert_eq!(second.secrets.len(), 1);
    assert_ne!(first.version, second.version);
}

#[tokio::test]
async fn expiring_certificate_keeps_tls_while_renewal_is_pending() {
    let pipeline = Pipeline::new();
    pipeline.registry.set_services(vec![service(
        "web",
        &[("envoy.endpoint.port", "8080"), ("envoy.route.domain", "example.com")],
    )]);
    pipeline.store_certificate("example.com", &["example.com"], 10).await;

    pipeline.manager.run_pass(UpdateReason::InitialDiscovery).await.unwrap();
    assert!(pipeline.lifecycle.schedule_renewals().await);
    assert!(pipeline.lifecycle.backlog().contains_key("example.com"));

    let snapshot = pipeline.manager.run_pass(UpdateReason::RenewalScheduled).await.unwrap();

    // still valid, so TLS stays up and the challenge route rides on the TLS chain
    let https = listener(&snapshot, HTTPS_LISTENER).unwrap();
    let vhosts = vhosts_of(&https.filter_chains[0]);
    assert_eq!(vhosts[0].routes[0].name, ACME_HTTP01_ROUTE);

    let route = &vhosts[0].routes[0];
    if let Some(Action::Route(action)) = &route.action {
        assert_eq!(
            action.cluster_specifier,
            Some(ClusterSpecifier::Cluster(ACME_CLUSTER.to_string()))
        );
    } else {
        panic!("challenge route must forward to the ACME cluster");
    }
}

#[tokio::test]
async fn registry_failure_keeps_the_previous_snapshot() {
    let pipeline = Pipeline::new();
    pipeline.registry.set_services(vec![service(
        "web",
        &[("envoy.endpoint.port", "8080"), ("envoy.route.domain", "example.com")],
    )]);
    let published = pipeline.manager.run_pass(UpdateReason::InitialDiscovery).await.unwrap();

    pipeline.registry.fail_listing(Some("docker daemon unreachable"));
    assert!(pipeline.manager.run_pass(UpdateReason::ServiceChanged).await.is_err());

    let current = pipeline.state.snapshot(EDGE_GROUP).unwrap();
    assert_eq!(current.version, published.version);
}
