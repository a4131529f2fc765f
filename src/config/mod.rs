//! # Configuration Management
//!
//! Settings are layered: built-in defaults, an optional config file, then
//! `EDGEPLANE_` prefixed environment variables (nested keys use `__`, e.g.
//! `EDGEPLANE_ACME__EMAIL`). Command line flags are applied on top by the binary.

pub mod settings;

pub use settings::{
    AcmeConfig, AppConfig, DiscoveryConfig, FailurePolicy, ObjectStorageConfig,
    ObservabilityConfig, RegistryConfig, StorageConfig, XdsConfig,
};

use crate::errors::Result;
use std::path::Path;

/// Application configuration
pub type Config = AppConfig;

/// Environment prefix for every setting
pub const ENV_PREFIX: &str = "EDGEPLANE";

impl AppConfig {
    /// Load configuration from the environment only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load configuration from an optional file plus the environment and validate it
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: AppConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }
}
