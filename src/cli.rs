//! # Command Line Interface
//!
//! Flags override the file and environment configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{AppConfig, FailurePolicy};

#[derive(Debug, Parser)]
#[command(name = "edgeplane")]
#[command(about = "Envoy control plane for Docker Swarm services")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "EDGEPLANE_CONFIG")]
    pub config: Option<PathBuf>,

    /// xDS server port
    #[arg(long)]
    pub xds_port: Option<u16>,

    /// Docker Engine endpoint, e.g. unix:///var/run/docker.sock
    #[arg(long)]
    pub docker_host: Option<String>,

    /// Network shared by Envoy and the exposed services
    #[arg(long)]
    pub ingress_network: Option<String>,

    /// Enable LetsEncrypt certificates for the given account email
    #[arg(long)]
    pub acme_email: Option<String>,

    /// Directory for certificates and ACME account data
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// What to do when a discovery pass fails
    #[arg(long, value_parser = parse_policy)]
    pub on_error: Option<FailurePolicy>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Apply the given flags on top of `config`
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(port) = self.xds_port {
            config.xds.port = port;
        }
        if let Some(host) = &self.docker_host {
            config.registry.docker_host = host.clone();
        }
        if let Some(network) = &self.ingress_network {
            config.registry.ingress_network = network.clone();
        }
        if let Some(email) = &self.acme_email {
            config.acme.enabled = true;
            config.acme.email = email.clone();
        }
        if let Some(directory) = &self.storage_dir {
            config.storage.directory = directory.clone();
        }
        if let Some(policy) = self.on_error {
            config.discovery.on_error = policy;
        }
        if self.verbose {
            config.observability.log_level = "debug".to_string();
        }
    }
}

fn parse_policy(value: &str) -> Result<FailurePolicy, String> {
    match value.to_ascii_lowercase().as_str() {
        "exit" => Ok(FailurePolicy::Exit),
        "retry" => Ok(FailurePolicy::Retry),
        other => Err(format!("unknown policy '{}', expected exit or retry", other)),
    }
}
