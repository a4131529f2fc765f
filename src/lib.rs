//! # Edgeplane
//!
//! Envoy control plane for Docker Swarm. Services opt into the edge proxy with
//! `envoy.*` labels; edgeplane turns them into clusters, virtual hosts and
//! listeners, obtains LetsEncrypt certificates for their domains and serves
//! the result to Envoy over xDS.
//!
//! ## Architecture
//!
//! ```text
//! swarm events ─┐
//! ACME timers ──┼─> event channel ─> SnapshotManager ─> XdsState ─> ADS/SDS ─> Envoy
//! startup ──────┘                        │
//!                      registry ─> SwarmProvider ─> ListenerProvider ─> CertificateSecretsProvider
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use edgeplane::{Config, ControlPlane, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_env()?;
//!     let control_plane = ControlPlane::new(config)?;
//!     control_plane.run(CancellationToken::new()).await
//! }
//! ```

pub mod acme;
pub mod cli;
pub mod config;
pub mod control_plane;
pub mod discovery;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod registry;
pub mod storage;
pub mod utils;
pub mod watcher;
pub mod xds;

// Re-export commonly used types and traits
pub use config::Config;
pub use control_plane::ControlPlane;
pub use errors::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
