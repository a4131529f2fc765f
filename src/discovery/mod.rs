//! # Discovery pipeline
//!
//! Producers send an [`UpdateReason`] whenever the proxy configuration may
//! have changed. The [`SnapshotManager`] consumes those reasons one at a time
//! and runs a discovery pass: the [`AdsProvider`] turns the registry into
//! clusters and listeners, the [`SecretsProvider`] returns the secrets those
//! listeners reference, and the result is published as one snapshot.

pub mod manager;
pub mod provider;

use std::fmt;

use async_trait::async_trait;

pub use manager::SnapshotManager;
pub use provider::SwarmProvider;

use crate::xds::BuiltResource;
use crate::Result;

/// Why a discovery pass was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateReason {
    InitialDiscovery,
    ServiceChanged,
    CertificateIssued,
    RenewalScheduled,
}

impl UpdateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateReason::InitialDiscovery => "initial discovery",
            UpdateReason::ServiceChanged => "a swarm service changed",
            UpdateReason::CertificateIssued => "new LetsEncrypt certificate rotated",
            UpdateReason::RenewalScheduled => "LetsEncrypt renewal scheduled",
        }
    }
}

impl fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the clusters and listeners of a pass
#[async_trait]
pub trait AdsProvider: Send + Sync {
    /// Returns `(clusters, listeners)`
    async fn provide(&self) -> Result<(Vec<BuiltResource>, Vec<BuiltResource>)>;
}

/// Source of the secrets referenced by the listeners of the same pass.
///
/// Must be called after [`AdsProvider::provide`].
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn provide(&self) -> Result<Vec<BuiltResource>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_render_as_log_messages() {
        assert_eq!(UpdateReason::InitialDiscovery.to_string(), "initial discovery");
        assert_eq!(UpdateReason::ServiceChanged.to_string(), "a swarm service changed");
        assert_eq!(
            UpdateReason::CertificateIssued.to_string(),
            "new LetsEncrypt certificate rotated"
        );
        assert_eq!(UpdateReason::RenewalScheduled.as_str(), "LetsEncrypt renewal scheduled");
    }
}
