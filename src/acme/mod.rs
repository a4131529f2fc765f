//! # ACME certificates
//!
//! Automatic TLS for exposed domains.
//!
//! - [`Acme`] obtains a certificate for a domain set. [`client::LetsEncryptClient`]
//!   implements it with `instant-acme` and HTTP-01 challenges.
//! - [`ChallengeManager`] holds pending HTTP-01 challenges and
//!   [`challenge::serve_challenges`] answers them.
//! - [`CertificateLifecycle`] decides which domain sets need a certificate,
//!   issues them and schedules renewals.
//!
//! Envoy routes `/.well-known` on every vhost waiting for a certificate to the
//! ACME cluster, which points at the challenge responder.

pub mod challenge;
#[cfg(feature = "letsencrypt")]
pub mod client;
pub mod lifecycle;

pub use challenge::{ChallengeManager, ACME_CHALLENGE_PREFIX};
#[cfg(feature = "letsencrypt")]
pub use client::LetsEncryptClient;
pub use lifecycle::CertificateLifecycle;

pub use crate::storage::CertificateBundle;

use async_trait::async_trait;

use crate::errors::Result;

/// Certificate authority capability
#[async_trait]
pub trait Acme: Send + Sync {
    /// Obtain a certificate covering every domain of `domains`; the first
    /// domain is the primary one.
    async fn obtain(&self, domains: &[String]) -> Result<CertificateBundle>;
}
