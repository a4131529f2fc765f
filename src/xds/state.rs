use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use envoy_types::pb::envoy::config::core::v3::Node;
use tokio::sync::broadcast;
use tracing::info;

use crate::observability::MetricsRecorder;
use crate::xds::snapshot::{NodeHash, Snapshot, SnapshotCache, StaticHash};
use crate::Result;

/// Broadcast payload announcing a newly published snapshot
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotUpdate {
    pub group: String,
    pub version: String,
}

/// Published snapshots per configuration group, shared by all xDS streams
pub struct XdsState {
    node_hash: Arc<dyn NodeHash>,
    snapshots: RwLock<HashMap<String, Arc<Snapshot>>>,
    update_tx: broadcast::Sender<Arc<SnapshotUpdate>>,
    metrics: MetricsRecorder,
}

impl std::fmt::Debug for XdsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups: Vec<String> =
            self.snapshots.read().expect("snapshot lock poisoned").keys().cloned().collect();
        f.debug_struct("XdsState").field("groups", &groups).finish()
    }
}

impl Default for XdsState {
    fn default() -> Self {
        Self::new()
    }
}

impl XdsState {
    pub fn new() -> Self {
        Self::with_node_hash(Arc::new(StaticHash))
    }

    pub fn with_node_hash(node_hash: Arc<dyn NodeHash>) -> Self {
        let (update_tx, _) = broadcast::channel(128);
        Self {
            node_hash,
            snapshots: RwLock::new(HashMap::new()),
            update_tx,
            metrics: MetricsRecorder::new(),
        }
    }

    /// Configuration group of a connecting node
    pub fn group_of(&self, node: Option<&Node>) -> String {
        self.node_hash.id(node)
    }

    pub fn snapshot(&self, group: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.read().expect("snapshot lock poisoned").get(group).cloned()
    }

    /// Version of the group's snapshot, empty before the first publication
    pub fn get_version(&self, group: &str) -> String {
        self.snapshot(group).map(|s| s.version.clone()).unwrap_or_default()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<Arc<SnapshotUpdate>> {
        self.update_tx.subscribe()
    }

    pub(crate) fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }
}

impl SnapshotCache for XdsState {
    fn set_snapshot(&self, group: &str, snapshot: Snapshot) -> Result<()> {
        let update = Arc::new(SnapshotUpdate {
            group: group.to_string(),
            version: snapshot.version.clone(),
        });

        self.metrics.update_snapshot_resources(
            snapshot.clusters.len(),
            snapshot.listeners.len(),
            snapshot.secrets.len(),
        );
        info!(
            group = %group,
            version = %snapshot.version,
            clusters = snapshot.clusters.len(),
            listeners = snapshot.listeners.len(),
            secrets = snapshot.secrets.len(),
            "Published snapshot"
        );

        self.snapshots
            .write()
            .expect("snapshot lock poisoned")
            .insert(group.to_string(), Arc::new(snapshot));

        // no receivers just means no proxy is connected yet
        let _ = self.update_tx.send(update);
        Ok(())
    }
}
