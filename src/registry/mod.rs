//! # Service registry
//!
//! The control plane reads swarm services, the ingress network and service
//! change events through [`ServiceRegistry`]. [`DockerRegistry`] talks to the
//! Docker Engine API; [`MemoryRegistry`] keeps everything in process.

pub mod docker;
pub mod memory;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

pub use docker::{DockerHost, DockerRegistry};
pub use memory::MemoryRegistry;

use crate::Result;

/// Scope a network must have to reach services on every node
pub const SWARM_SCOPE: &str = "swarm";

/// Swarm service as far as routing is concerned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub virtual_ips: Vec<VirtualIp>,
}

impl ServiceDescriptor {
    /// Whether the service has a virtual IP on the given network
    pub fn is_attached_to(&self, network_id: &str) -> bool {
        self.virtual_ips.iter().any(|vip| vip.network_id == network_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualIp {
    pub network_id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDescriptor {
    pub id: String,
    pub name: String,
    pub scope: String,
}

/// A change to a swarm service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceEvent {
    /// `create`, `update` or `remove`
    pub action: String,
    pub service_id: String,
    pub service_name: Option<String>,
}

pub type ServiceEventStream = Pin<Box<dyn Stream<Item = Result<ServiceEvent>> + Send>>;

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>>;

    /// Inspect a network by name or ID
    async fn inspect_network(&self, id: &str) -> Result<NetworkDescriptor>;

    /// Subscribe to service events. An error item or the end of the stream
    /// means the subscription is gone and has to be renewed.
    async fn events(&self) -> Result<ServiceEventStream>;
}
