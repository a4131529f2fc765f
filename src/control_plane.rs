//! Wiring of the discovery pipeline, the producers and the servers

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acme::{challenge::serve_challenges, CertificateLifecycle, ChallengeManager};
use crate::config::AppConfig;
use crate::discovery::{SnapshotManager, SwarmProvider};
use crate::observability::component_span;
use crate::registry::{DockerRegistry, ServiceRegistry};
use crate::storage::{
    CertificateStore, DiskStorage, FileCertificateStore, FileStorage, ObjectStorage, S3Client,
};
use crate::watcher::{event_channel, trigger_initial_discovery, CertificateWatcher, SwarmWatcher};
use crate::xds::cluster::acme_cluster;
use crate::xds::{start_xds_server, CertificateSecretsProvider, ListenerProvider, XdsState};
use crate::{Error, Result};

/// The whole control plane for one configuration
pub struct ControlPlane {
    config: AppConfig,
    registry: Arc<dyn ServiceRegistry>,
    storage: Arc<dyn FileStorage>,
    state: Arc<XdsState>,
}

impl ControlPlane {
    /// Control plane backed by the Docker Engine and the storage directory,
    /// mirrored to a bucket when object storage is configured
    pub fn new(config: AppConfig) -> Result<Self> {
        let registry = DockerRegistry::from_config(&config.registry, component_span("registry"))?;
        let disk = DiskStorage::new(&config.storage.directory);
        let storage: Arc<dyn FileStorage> = match &config.storage.object {
            Some(object) => {
                info!(bucket = %object.bucket, "Certificates are mirrored to object storage");
                let client = S3Client::from_config(object)?;
                Arc::new(ObjectStorage::new(Arc::new(client), disk).with_timeout(object.timeout()))
            }
            None => Arc::new(disk),
        };
        Ok(Self::with_parts(config, Arc::new(registry), storage))
    }

    pub fn with_parts(
        config: AppConfig,
        registry: Arc<dyn ServiceRegistry>,
        storage: Arc<dyn FileStorage>,
    ) -> Self {
        Self { config, registry, storage, state: Arc::new(XdsState::new()) }
    }

    /// Published snapshots, shared with the xDS server
    pub fn state(&self) -> Arc<XdsState> {
        self.state.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run until `shutdown` is cancelled or discovery fails under the `exit` policy
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = &self.config;
        let store: Arc<dyn CertificateStore> =
            Arc::new(FileCertificateStore::new(self.storage.clone()));
        let secrets = Arc::new(CertificateSecretsProvider::new(
            &config.xds.control_plane_cluster,
            store.clone(),
            component_span("secrets"),
        ));

        let challenges = ChallengeManager::new();
        let lifecycle = self.lifecycle(store, &challenges)?;

        let listeners =
            ListenerProvider::new(secrets.clone(), lifecycle.clone(), component_span("listeners"));
        let mut provider = SwarmProvider::new(
            self.registry.clone(),
            &config.registry.ingress_network,
            listeners,
            component_span("swarm"),
        );
        if config.acme.enabled {
            if let Some(address) = &config.acme.challenge_address {
                provider = provider.with_acme_cluster(acme_cluster(
                    &config.acme.cluster_name,
                    address,
                    config.acme.challenge_port,
                )?);
            }
        }

        let manager = SnapshotManager::with_config(
            Arc::new(provider),
            secrets,
            self.state.clone(),
            &config.discovery,
            component_span("snapshot"),
        );

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        self.spawn_servers(&mut tasks, &challenges, &shutdown)?;

        let (sender, receiver) = event_channel();
        trigger_initial_discovery(&sender).await?;

        let watcher = SwarmWatcher::new(
            self.registry.clone(),
            config.registry.max_backoff(),
            component_span("swarm_watcher"),
        );
        let (watcher_sender, watcher_shutdown) = (sender.clone(), shutdown.clone());
        tasks.spawn(async move {
            watcher.run(watcher_sender, watcher_shutdown).await;
            Ok(())
        });

        if let Some(lifecycle) = lifecycle {
            let watcher =
                CertificateWatcher::from_config(lifecycle, &config.acme, component_span("letsencrypt"));
            let (watcher_sender, watcher_shutdown) = (sender.clone(), shutdown.clone());
            tasks.spawn(async move {
                watcher.run(watcher_sender, watcher_shutdown).await;
                Ok(())
            });
        }
        drop(sender);

        let outcome = manager.listen(receiver).await;
        shutdown.cancel();

        let mut task_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Control plane task failed");
                    task_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Control plane task panicked");
                    task_error.get_or_insert(Error::internal(e.to_string()));
                }
            }
        }

        info!("Control plane stopped");
        outcome?;
        task_error.map_or(Ok(()), Err)
    }

    fn lifecycle(
        &self,
        store: Arc<dyn CertificateStore>,
        challenges: &ChallengeManager,
    ) -> Result<Option<Arc<CertificateLifecycle>>> {
        let acme = &self.config.acme;
        if !acme.enabled {
            info!("ACME disabled, services are served over plain HTTP");
            return Ok(None);
        }

        #[cfg(feature = "letsencrypt")]
        {
            let client = crate::acme::LetsEncryptClient::new(
                &acme.email,
                &acme.directory_url,
                self.storage.clone(),
                challenges.clone(),
                component_span("acme_client"),
            );
            let lifecycle = CertificateLifecycle::new(
                Arc::new(client),
                store,
                &acme.cluster_name,
                component_span("certificates"),
            )
            .with_renew_before(acme.renew_before());
            Ok(Some(Arc::new(lifecycle)))
        }

        #[cfg(not(feature = "letsencrypt"))]
        {
            let _ = (store, challenges);
            Err(Error::config("ACME is enabled but edgeplane was built without the letsencrypt feature"))
        }
    }

    fn spawn_servers(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        challenges: &ChallengeManager,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let xds = self.config.xds.clone();
        let state = self.state.clone();
        let token = shutdown.clone();
        tasks.spawn(async move {
            let result = start_xds_server(&xds, state, token.clone()).await;
            if result.is_err() {
                token.cancel();
            }
            result
        });

        if !self.config.acme.enabled {
            return Ok(());
        }

        let address: SocketAddr =
            self.config.acme.challenge_socket_address().parse().map_err(|e| {
                Error::config(format!("Invalid ACME challenge address: {}", e))
            })?;
        if self.config.acme.challenge_address.is_none() {
            warn!(
                cluster = %self.config.acme.cluster_name,
                "No challenge address configured, the ACME cluster must come from the Envoy bootstrap"
            );
        }

        let manager = challenges.clone();
        let token = shutdown.clone();
        tasks.spawn(async move {
            let result = serve_challenges(address, manager, token.clone()).await;
            if result.is_err() {
                token.cancel();
            }
            result
        });
        Ok(())
    }
}
