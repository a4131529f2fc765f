//! In-process registry, used for tests and dry runs

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use super::{
    NetworkDescriptor, ServiceDescriptor, ServiceEvent, ServiceEventStream, ServiceRegistry,
};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Contents {
    services: Vec<ServiceDescriptor>,
    networks: HashMap<String, NetworkDescriptor>,
    fail_listing: Option<String>,
}

/// Registry whose contents are set by the caller. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    contents: Arc<RwLock<Contents>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self { contents: Arc::new(RwLock::new(Contents::default())), events }
    }

    fn contents(&self) -> std::sync::RwLockWriteGuard<'_, Contents> {
        self.contents.write().expect("registry lock poisoned")
    }

    pub fn add_network(&self, network: NetworkDescriptor) {
        self.contents().networks.insert(network.id.clone(), network);
    }

    pub fn set_services(&self, services: Vec<ServiceDescriptor>) {
        self.contents().services = services;
    }

    /// Make `list_services` fail with the given message, `None` to recover
    pub fn fail_listing(&self, message: Option<&str>) {
        self.contents().fail_listing = message.map(str::to_string);
    }

    /// Deliver an event to every current subscriber
    pub fn emit(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>> {
        let contents = self.contents.read().expect("registry lock poisoned");
        match &contents.fail_listing {
            Some(message) => Err(Error::registry(message.clone())),
            None => Ok(contents.services.clone()),
        }
    }

    async fn inspect_network(&self, id: &str) -> Result<NetworkDescriptor> {
        let contents = self.contents.read().expect("registry lock poisoned");
        contents
            .networks
            .get(id)
            .or_else(|| contents.networks.values().find(|n| n.name == id))
            .cloned()
            .ok_or_else(|| Error::registry(format!("network {} not found", id)))
    }

    async fn events(&self) -> Result<ServiceEventStream> {
        let stream = BroadcastStream::new(self.events.subscribe()).map(|item| {
            item.map_err(|e| Error::registry(format!("event subscription lagged: {}", e)))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn networks_resolve_by_id_or_name() {
        let registry = MemoryRegistry::new();
        registry.add_network(NetworkDescriptor {
            id: "n1".to_string(),
            name: "edge-traffic".to_string(),
            scope: "swarm".to_string(),
        });

        assert_eq!(registry.inspect_network("n1").await.unwrap().name, "edge-traffic");
        assert_eq!(registry.inspect_network("edge-traffic").await.unwrap().id, "n1");
        assert!(registry.inspect_network("missing").await.is_err());
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let registry = MemoryRegistry::new();
        let mut events = registry.events().await.unwrap();
        assert_eq!(registry.subscriber_count(), 1);

        registry.emit(ServiceEvent {
            action: "update".to_string(),
            service_id: "s1".to_string(),
            service_name: None,
        });

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.action, "update");
    }

    #[tokio::test]
    async fn listing_failure_is_a_registry_error() {
        let registry = MemoryRegistry::new();
        registry.fail_listing(Some("daemon unreachable"));
        let err = registry.list_services().await.unwrap_err();
        assert!(err.is_retryable());

        registry.fail_listing(None);
        assert!(registry.list_services().await.unwrap().is_empty());
    }
}
