//! Single consumer of the discovery event channel

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Instrument, Span};

use super::{AdsProvider, SecretsProvider, UpdateReason};
use crate::config::{DiscoveryConfig, FailurePolicy};
use crate::observability::MetricsRecorder;
use crate::utils::Backoff;
use crate::xds::snapshot::snapshot_version;
use crate::xds::{Snapshot, SnapshotCache, EDGE_GROUP};
use crate::{discovery_span, Error, Result};

pub const MIN_PASS_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_PASS_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Runs discovery passes and publishes their snapshots
pub struct SnapshotManager {
    ads: Arc<dyn AdsProvider>,
    secrets: Arc<dyn SecretsProvider>,
    cache: Arc<dyn SnapshotCache>,
    timeout: Duration,
    policy: FailurePolicy,
    retry_max_attempts: u32,
    retry_max_backoff: Duration,
    metrics: MetricsRecorder,
    span: Span,
}

impl SnapshotManager {
    pub fn new(
        ads: Arc<dyn AdsProvider>,
        secrets: Arc<dyn SecretsProvider>,
        cache: Arc<dyn SnapshotCache>,
        span: Span,
    ) -> Self {
        Self::with_config(ads, secrets, cache, &DiscoveryConfig::default(), span)
    }

    pub fn with_config(
        ads: Arc<dyn AdsProvider>,
        secrets: Arc<dyn SecretsProvider>,
        cache: Arc<dyn SnapshotCache>,
        config: &DiscoveryConfig,
        span: Span,
    ) -> Self {
        Self {
            ads,
            secrets,
            cache,
            timeout: clamp_timeout(config.timeout()),
            policy: config.on_error,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_max_backoff: config.retry_max_backoff(),
            metrics: MetricsRecorder::new(),
            span,
        }
    }

    /// Deadline of one pass
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Process reasons until every sender is gone.
    ///
    /// With the `exit` policy the first failed pass ends the loop with its
    /// error. With `retry` a failed pass is retried with backoff and then
    /// given up on until the next reason arrives; the last published snapshot
    /// keeps being served meanwhile.
    pub async fn listen(&self, mut receiver: mpsc::Receiver<UpdateReason>) -> Result<()> {
        async {
            info!(timeout_s = self.timeout.as_secs(), policy = ?self.policy, "Snapshot manager started");

            while let Some(reason) = receiver.recv().await {
                match self.policy {
                    FailurePolicy::Exit => {
                        if let Err(e) = self.run_pass(reason).await {
                            error!(reason = %reason, error = %e, "Discovery failed, stopping");
                            return Err(e);
                        }
                    }
                    FailurePolicy::Retry => self.run_with_retries(reason).await,
                }
            }

            info!("Event channel closed, snapshot manager stopped");
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }

    async fn run_with_retries(&self, reason: UpdateReason) {
        let mut backoff = Backoff::new(RETRY_INITIAL_BACKOFF, self.retry_max_backoff);

        loop {
            let error = match self.run_pass(reason).await {
                Ok(_) => return,
                Err(e) => e,
            };

            if !error.is_retryable() {
                error!(
                    reason = %reason,
                    error = %error,
                    "Discovery failed and will not succeed on retry, keeping the last snapshot until the next event"
                );
                return;
            }

            if backoff.attempt() + 1 >= self.retry_max_attempts {
                error!(
                    reason = %reason,
                    attempts = self.retry_max_attempts,
                    error = %error,
                    "Discovery failed, keeping the last snapshot until the next event"
                );
                return;
            }

            let delay = backoff.next_delay();
            warn!(
                reason = %reason,
                attempt = backoff.attempt(),
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Discovery failed, retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run one pass under the deadline and publish its snapshot
    pub async fn run_pass(&self, reason: UpdateReason) -> Result<Snapshot> {
        let span = discovery_span!(reason);
        span.follows_from(&self.span);
        let started = Instant::now();

        let result = tokio::time::timeout(self.timeout, self.discover())
            .instrument(span.clone())
            .await
            .map_err(|_| Error::timeout("discovery pass", self.timeout.as_millis() as u64))
            .and_then(|result| result);

        let success = result.is_ok();
        self.metrics.record_discovery_pass(
            reason.as_str(),
            success,
            started.elapsed().as_secs_f64(),
        );

        let snapshot = result?;
        span.record("version", snapshot.version.as_str());
        self.cache.set_snapshot(EDGE_GROUP, snapshot.clone())?;
        info!(
            parent: &span,
            version = %snapshot.version,
            resources = snapshot.resource_count(),
            "Discovery pass published a snapshot"
        );
        Ok(snapshot)
    }

    async fn discover(&self) -> Result<Snapshot> {
        let (clusters, listeners) = self.ads.provide().await?;
        let secrets = self.secrets.provide().await?;

        let snapshot = Snapshot::new(snapshot_version(Utc::now()), clusters, listeners, secrets);
        snapshot.consistent()?;
        Ok(snapshot)
    }
}

fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.clamp(MIN_PASS_TIMEOUT, MAX_PASS_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::resources::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL};
    use crate::xds::BuiltResource;
    use async_trait::async_trait;
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use envoy_types::pb::envoy::config::listener::v3::Listener;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    /// Returns scripted results, then succeeds forever
    #[derive(Default)]
    struct ScriptedAds {
        failures: Mutex<VecDeque<Error>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedAds {
        fn failing(errors: Vec<Error>) -> Self {
            Self { failures: Mutex::new(errors.into()), ..Default::default() }
        }
    }

    #[async_trait]
    impl AdsProvider for ScriptedAds {
        async fn provide(&self) -> Result<(Vec<BuiltResource>, Vec<BuiltResource>)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }

            let cluster = Cluster { name: "web".to_string(), ..Default::default() };
            let listener = Listener { name: "http_listener".to_string(), ..Default::default() };
            Ok((
                vec![BuiltResource::new("web", CLUSTER_TYPE_URL, &cluster)],
                vec![BuiltResource::new("http_listener", LISTENER_TYPE_URL, &listener)],
            ))
        }
    }

    struct NoSecrets;

    #[async_trait]
    impl SecretsProvider for NoSecrets {
        async fn provide(&self) -> Result<Vec<BuiltResource>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingCache {
        published: Mutex<Vec<(String, Snapshot)>>,
    }

    impl SnapshotCache for RecordingCache {
        fn set_snapshot(&self, group: &str, snapshot: Snapshot) -> Result<()> {
            self.published.lock().unwrap().push((group.to_string(), snapshot));
            Ok(())
        }
    }

    fn manager(
        ads: Arc<ScriptedAds>,
        cache: Arc<RecordingCache>,
        config: DiscoveryConfig,
    ) -> SnapshotManager {
        SnapshotManager::with_config(ads, Arc::new(NoSecrets), cache, &config, Span::none())
    }

    #[test]
    fn timeout_is_clamped() {
        assert_eq!(clamp_timeout(Duration::from_secs(1)), MIN_PASS_TIMEOUT);
        assert_eq!(clamp_timeout(Duration::from_secs(12)), Duration::from_secs(12));
        assert_eq!(clamp_timeout(Duration::from_secs(300)), MAX_PASS_TIMEOUT);
    }

    #[tokio::test]
    async fn every_reason_publishes_a_snapshot_for_the_edge_group() {
        let ads = Arc::new(ScriptedAds::default());
        let cache = Arc::new(RecordingCache::default());
        let manager = manager(ads.clone(), cache.clone(), DiscoveryConfig::default());

        let (tx, rx) = mpsc::channel(1);
        let producer = tokio::spawn(async move {
            tx.send(UpdateReason::InitialDiscovery).await.unwrap();
            tx.send(UpdateReason::ServiceChanged).await.unwrap();
            tx.send(UpdateReason::ServiceChanged).await.unwrap();
        });

        manager.listen(rx).await.unwrap();
        producer.await.unwrap();

        let published = cache.published.lock().unwrap();
        assert_eq!(published.len(), 3);
        assert!(published.iter().all(|(group, _)| group == EDGE_GROUP));
        assert_eq!(published[0].1.clusters.len(), 1);
        assert_eq!(ads.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn exit_policy_returns_the_first_error() {
        let ads = Arc::new(ScriptedAds::failing(vec![Error::registry("daemon unreachable")]));
        let cache = Arc::new(RecordingCache::default());
        let manager = manager(ads, cache.clone(), DiscoveryConfig::default());

        let (tx, rx) = mpsc::channel(1);
        tx.send(UpdateReason::InitialDiscovery).await.unwrap();
        drop(tx);

        let err = manager.listen(rx).await.unwrap_err();
        assert!(matches!(err, Error::Registry { .. }));
        assert!(cache.published.lock().unwrap().is_empty());
        assert!(logs_contain("Discovery failed, stopping"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_recovers_after_backoff() {
        let ads = Arc::new(ScriptedAds::failing(vec![
            Error::registry("daemon unreachable"),
            Error::registry("daemon unreachable"),
        ]));
        let cache = Arc::new(RecordingCache::default());
        let config = DiscoveryConfig { on_error: FailurePolicy::Retry, ..Default::default() };
        let manager = manager(ads.clone(), cache.clone(), config);

        let (tx, rx) = mpsc::channel(1);
        tx.send(UpdateReason::InitialDiscovery).await.unwrap();
        drop(tx);

        manager.listen(rx).await.unwrap();

        assert_eq!(ads.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.published.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn retry_policy_gives_up_until_the_next_reason() {
        let errors = (0..3).map(|_| Error::registry("daemon unreachable")).collect();
        let ads = Arc::new(ScriptedAds::failing(errors));
        let cache = Arc::new(RecordingCache::default());
        let config = DiscoveryConfig {
            on_error: FailurePolicy::Retry,
            retry_max_attempts: 2,
            ..Default::default()
        };
        let manager = manager(ads.clone(), cache.clone(), config);

        let (tx, rx) = mpsc::channel(1);
        let producer = tokio::spawn(async move {
            tx.send(UpdateReason::InitialDiscovery).await.unwrap();
            tx.send(UpdateReason::ServiceChanged).await.unwrap();
        });

        manager.listen(rx).await.unwrap();
        producer.await.unwrap();

        // two failed attempts for the first reason, then one failure and a
        // success for the second
        assert_eq!(ads.calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.published.lock().unwrap().len(), 1);
        assert!(logs_contain("keeping the last snapshot"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn retry_policy_skips_errors_that_cannot_recover() {
        let ads = Arc::new(ScriptedAds::failing(vec![Error::config(
            "the provided ingress network is not scoped for the entire cluster (swarm)",
        )]));
        let cache = Arc::new(RecordingCache::default());
        let config = DiscoveryConfig { on_error: FailurePolicy::Retry, ..Default::default() };
        let manager = manager(ads.clone(), cache.clone(), config);

        let (tx, rx) = mpsc::channel(1);
        tx.send(UpdateReason::InitialDiscovery).await.unwrap();
        drop(tx);

        manager.listen(rx).await.unwrap();

        assert_eq!(ads.calls.load(Ordering::SeqCst), 1);
        assert!(cache.published.lock().unwrap().is_empty());
        assert!(logs_contain("will not succeed on retry"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pass_hits_the_deadline() {
        let ads = Arc::new(ScriptedAds {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let cache = Arc::new(RecordingCache::default());
        let manager = manager(ads, cache.clone(), DiscoveryConfig::default());

        let err = manager.run_pass(UpdateReason::InitialDiscovery).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { duration_ms: 5000, .. }));
        assert!(cache.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inconsistent_snapshot_is_never_published() {
        use crate::xds::filter_chain::FilterChainBuilder;
        use crate::xds::listener::ListenerBuilder;
        use crate::xds::secret::sds_config_source;
        use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::SdsSecretConfig;

        struct TlsAds;

        #[async_trait]
        impl AdsProvider for TlsAds {
            async fn provide(&self) -> Result<(Vec<BuiltResource>, Vec<BuiltResource>)> {
                let secret = SdsSecretConfig {
                    name: "downstream_tls_example.com".to_string(),
                    sds_config: Some(sds_config_source("control_plane")),
                };
                let vhost = envoy_types::pb::envoy::config::route::v3::VirtualHost {
                    name: "example.com".to_string(),
                    domains: vec!["example.com".to_string()],
                    ..Default::default()
                };
                let mut https = ListenerBuilder::new("https_listener", 443);
                https.add_filter_chain(
                    FilterChainBuilder::new("example.com")
                        .enable_tls(vec!["example.com".to_string()], secret)
                        .with_vhost(vhost),
                );
                let listener = https.build()?;
                Ok((
                    Vec::new(),
                    vec![BuiltResource::new(listener.name.clone(), LISTENER_TYPE_URL, &listener)],
                ))
            }
        }

        let cache = Arc::new(RecordingCache::default());
        let manager = SnapshotManager::new(
            Arc::new(TlsAds),
            Arc::new(NoSecrets),
            cache.clone(),
            Span::none(),
        );

        let err = manager.run_pass(UpdateReason::CertificateIssued).await.unwrap_err();
        assert!(matches!(err, Error::Inconsistent(_)));
        assert!(cache.published.lock().unwrap().is_empty());
    }
}
