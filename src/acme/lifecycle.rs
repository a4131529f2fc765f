//! Certificate lifecycle
//!
//! Per primary domain a certificate moves through
//! `absent → queued for issuing → issued → queued for renewal → queued for issuing`.
//! The issue backlog and the renewal list both map a primary domain to its
//! full domain set and live behind one mutex that is never held across an
//! await point.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{TimeDelta, Utc};
use envoy_types::pb::envoy::config::route::v3::VirtualHost;
use tracing::{debug, info, warn, Instrument, Span};

use super::Acme;
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use crate::storage::CertificateStore;
use crate::utils::certificates::parse_certificate_info;
use crate::xds::route::acme_challenge_route;

/// Renew certificates expiring within this window
pub const DEFAULT_RENEW_BEFORE: TimeDelta = TimeDelta::days(30);

#[derive(Debug, Default)]
struct Queues {
    backlog: BTreeMap<String, Vec<String>>,
    renewals: BTreeMap<String, Vec<String>>,
}

pub struct CertificateLifecycle {
    acme: Arc<dyn Acme>,
    store: Arc<dyn CertificateStore>,
    acme_cluster: String,
    renew_before: TimeDelta,
    queues: Mutex<Queues>,
    metrics: MetricsRecorder,
    span: Span,
}

impl CertificateLifecycle {
    pub fn new(
        acme: Arc<dyn Acme>,
        store: Arc<dyn CertificateStore>,
        acme_cluster: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            acme,
            store,
            acme_cluster: acme_cluster.into(),
            renew_before: DEFAULT_RENEW_BEFORE,
            queues: Mutex::new(Queues::default()),
            metrics: MetricsRecorder::new(),
            span,
        }
    }

    pub fn with_renew_before(mut self, renew_before: TimeDelta) -> Self {
        self.renew_before = renew_before;
        self
    }

    pub fn acme_cluster(&self) -> &str {
        &self.acme_cluster
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().expect("certificate queue lock poisoned")
    }

    fn publish_queue_sizes(&self, queues: &Queues) {
        self.metrics.update_certificate_queues(queues.backlog.len(), queues.renewals.len());
    }

    /// Queue the vhost's domains for issuing and return a copy of the vhost
    /// that answers HTTP-01 challenges through the ACME cluster.
    pub fn prepare_vhost_for_issuing(&self, vhost: &VirtualHost) -> VirtualHost {
        let _entered = self.span.enter();

        {
            let mut queues = self.queues();
            if let Entry::Vacant(entry) = queues.backlog.entry(vhost.name.clone()) {
                entry.insert(vhost.domains.clone());
                debug!(primary_domain = %vhost.name, domains = ?vhost.domains, "Queued domains for certificate issuing");
            }
            self.publish_queue_sizes(&queues);
        }

        let mut prepared = vhost.clone();
        prepared.routes.insert(0, acme_challenge_route(&self.acme_cluster));
        prepared
    }

    pub fn is_scheduled_for_issuing(&self, vhost: &VirtualHost) -> bool {
        self.queues().backlog.contains_key(&vhost.name)
    }

    /// Track the vhost's certificate for renewal
    pub fn enable_auto_renewal(&self, vhost: &VirtualHost) {
        let _entered = self.span.enter();

        let mut queues = self.queues();
        if let Entry::Vacant(entry) = queues.renewals.entry(vhost.name.clone()) {
            entry.insert(vhost.domains.clone());
            debug!(primary_domain = %vhost.name, "Enabled certificate auto renewal");
        }
        self.publish_queue_sizes(&queues);
    }

    /// Issue a certificate for every queued domain set.
    ///
    /// Every entry leaves the backlog whatever the outcome; a vhost still
    /// lacking a certificate is queued again by the next discovery pass.
    /// Returns whether at least one certificate was stored.
    pub async fn issue_certificates(&self) -> Result<bool> {
        let pending: Vec<(String, Vec<String>)> =
            self.queues().backlog.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        if pending.is_empty() {
            return Ok(false);
        }

        async {
            info!(count = pending.len(), "Issuing certificates");

            let mut issued_any = false;
            for (primary, domains) in pending {
                let issued = self.issue_one(&primary, &domains).await;
                self.metrics.record_certificate_issued(issued);
                issued_any |= issued;

                {
                    let mut queues = self.queues();
                    queues.backlog.remove(&primary);
                    self.publish_queue_sizes(&queues);
                }
            }

            Ok(issued_any)
        }
        .instrument(self.span.clone())
        .await
    }

    async fn issue_one(&self, primary: &str, domains: &[String]) -> bool {
        let bundle = match self.acme.obtain(domains).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(primary_domain = %primary, domains = ?domains, error = %e, "Failed to obtain certificate");
                return false;
            }
        };

        match self.store.put(primary, domains, &bundle.chain, &bundle.key).await {
            Ok(()) => {
                info!(primary_domain = %primary, domains = ?domains, "Certificate issued");
                true
            }
            Err(e) => {
                warn!(primary_domain = %primary, error = %e, "Failed to store issued certificate");
                false
            }
        }
    }

    /// Move certificates that expire soon, or cannot be read, from the
    /// renewal list to the issue backlog. Returns whether anything moved.
    pub async fn schedule_renewals(&self) -> bool {
        let tracked: Vec<(String, Vec<String>)> =
            self.queues().renewals.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        async {
            let now = Utc::now();
            let mut due = Vec::new();

            for (primary, domains) in tracked {
                let needs_renewal = match self.store.get(&primary, &domains).await {
                    Ok(bundle) => match parse_certificate_info(&bundle.chain, &bundle.key) {
                        Ok(info) => info.expires_within(self.renew_before, now),
                        Err(e) => {
                            warn!(primary_domain = %primary, error = %e, "Stored certificate is unreadable");
                            true
                        }
                    },
                    Err(e) => {
                        warn!(primary_domain = %primary, error = %e, "Stored certificate is missing");
                        true
                    }
                };

                if needs_renewal {
                    due.push((primary, domains));
                }
            }

            if due.is_empty() {
                debug!("No certificate is due for renewal");
                return false;
            }

            let mut queues = self.queues();
            for (primary, domains) in due {
                info!(primary_domain = %primary, "Certificate scheduled for renewal");
                queues.renewals.remove(&primary);
                queues.backlog.entry(primary).or_insert(domains);
            }
            self.publish_queue_sizes(&queues);
            true
        }
        .instrument(self.span.clone())
        .await
    }

    /// Queued domain sets by primary domain
    pub fn backlog(&self) -> BTreeMap<String, Vec<String>> {
        self.queues().backlog.clone()
    }

    /// Domain sets tracked for renewal by primary domain
    pub fn renewals(&self) -> BTreeMap<String, Vec<String>> {
        self.queues().renewals.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::CertificateBundle;
    use crate::errors::Error;
    use crate::storage::{FileCertificateStore, MemoryStorage};
    use crate::utils::certificates::test_support::self_signed;
    use crate::xds::route::{route_prefix, ACME_HTTP01_ROUTE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAcme {
        days_valid: i64,
        fail_for: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeAcme {
        fn new(days_valid: i64) -> Self {
            Self { days_valid, fail_for: None, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Acme for FakeAcme {
        async fn obtain(&self, domains: &[String]) -> Result<CertificateBundle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_for.as_deref() == domains.first().map(String::as_str) {
                return Err(Error::acme("order rejected"));
            }
            let names: Vec<&str> = domains.iter().map(String::as_str).collect();
            let (chain, key) = self_signed(&names, self.days_valid);
            Ok(CertificateBundle { chain: chain.into_bytes(), key: key.into_bytes() })
        }
    }

    fn vhost(name: &str, domains: &[&str]) -> VirtualHost {
        VirtualHost {
            name: name.to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn lifecycle(acme: Arc<FakeAcme>) -> (CertificateLifecycle, Arc<FileCertificateStore>) {
        let store = Arc::new(FileCertificateStore::new(Arc::new(MemoryStorage::new())));
        let lifecycle =
            CertificateLifecycle::new(acme, store.clone(), "control_plane_acme", Span::none());
        (lifecycle, store)
    }

    #[test]
    fn prepare_queues_once_and_prepends_acme_route() {
        let (lifecycle, _) = lifecycle(Arc::new(FakeAcme::new(90)));
        let mut host = vhost("example.com", &["example.com", "www.example.com"]);
        host.routes.push(Default::default());

        let prepared = lifecycle.prepare_vhost_for_issuing(&host);
        lifecycle.prepare_vhost_for_issuing(&host);

        assert_eq!(prepared.routes.len(), 2);
        assert_eq!(prepared.routes[0].name, ACME_HTTP01_ROUTE);
        assert_eq!(route_prefix(&prepared.routes[0]), "/.well-known");
        assert_eq!(lifecycle.backlog().len(), 1);
        assert_eq!(lifecycle.backlog()["example.com"], vec!["example.com", "www.example.com"]);
        assert!(lifecycle.is_scheduled_for_issuing(&host));
    }

    #[test]
    fn queued_domain_sets_are_not_replaced() {
        let (lifecycle, _) = lifecycle(Arc::new(FakeAcme::new(90)));

        lifecycle.prepare_vhost_for_issuing(&vhost("a.com", &["a.com"]));
        lifecycle.prepare_vhost_for_issuing(&vhost("a.com", &["a.com", "b.com"]));
        assert_eq!(lifecycle.backlog()["a.com"], vec!["a.com"]);

        lifecycle.enable_auto_renewal(&vhost("r.com", &["r.com"]));
        lifecycle.enable_auto_renewal(&vhost("r.com", &["r.com", "x.com"]));
        assert_eq!(lifecycle.renewals()["r.com"], vec!["r.com"]);
    }

    #[tokio::test]
    async fn issuing_stores_certificates_and_drains_backlog() {
        let acme = Arc::new(FakeAcme::new(90));
        let (lifecycle, store) = lifecycle(acme.clone());
        let host = vhost("example.com", &["example.com"]);
        lifecycle.prepare_vhost_for_issuing(&host);

        assert!(lifecycle.issue_certificates().await.unwrap());
        assert!(lifecycle.backlog().is_empty());
        assert!(!lifecycle.is_scheduled_for_issuing(&host));
        assert!(store.get("example.com", &host.domains).await.is_ok());

        assert!(!lifecycle.issue_certificates().await.unwrap());
        assert_eq!(acme.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let acme = Arc::new(FakeAcme {
            fail_for: Some("a.com".to_string()),
            ..FakeAcme::new(90)
        });
        let (lifecycle, store) = lifecycle(acme);
        lifecycle.prepare_vhost_for_issuing(&vhost("a.com", &["a.com"]));
        lifecycle.prepare_vhost_for_issuing(&vhost("b.com", &["b.com"]));

        assert!(lifecycle.issue_certificates().await.unwrap());
        assert!(lifecycle.backlog().is_empty());
        assert!(store.get("a.com", &["a.com".to_string()]).await.is_err());
        assert!(store.get("b.com", &["b.com".to_string()]).await.is_ok());
    }

    #[tokio::test]
    async fn renewal_moves_expiring_certificates_to_backlog() {
        let acme = Arc::new(FakeAcme::new(10));
        let (lifecycle, _) = lifecycle(acme);
        let host = vhost("example.com", &["example.com"]);

        lifecycle.prepare_vhost_for_issuing(&host);
        lifecycle.issue_certificates().await.unwrap();
        lifecycle.enable_auto_renewal(&host);
        lifecycle.enable_auto_renewal(&host);
        assert_eq!(lifecycle.renewals().len(), 1);

        assert!(lifecycle.schedule_renewals().await);
        assert!(lifecycle.renewals().is_empty());
        assert!(lifecycle.is_scheduled_for_issuing(&host));
    }

    #[tokio::test]
    async fn fresh_certificates_stay_in_renewal_list() {
        let acme = Arc::new(FakeAcme::new(90));
        let (lifecycle, _) = lifecycle(acme);
        let host = vhost("example.com", &["example.com"]);

        lifecycle.prepare_vhost_for_issuing(&host);
        lifecycle.issue_certificates().await.unwrap();
        lifecycle.enable_auto_renewal(&host);

        assert!(!lifecycle.schedule_renewals().await);
        assert_eq!(lifecycle.renewals().len(), 1);
        assert!(lifecycle.backlog().is_empty());
    }

    #[tokio::test]
    async fn missing_certificate_is_scheduled() {
        let (lifecycle, _) = lifecycle(Arc::new(FakeAcme::new(90)));
        lifecycle.enable_auto_renewal(&vhost("gone.com", &["gone.com"]));

        assert!(lifecycle.schedule_renewals().await);
        assert_eq!(lifecycle.backlog()["gone.com"], vec!["gone.com"]);
    }
}
