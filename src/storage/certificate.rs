//! Certificate persistence keyed by domain set

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::info;

use super::FileStorage;
use crate::errors::Result;

/// PEM encoded certificate chain and private key
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub chain: Vec<u8>,
    pub key: Vec<u8>,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("chain_bytes", &self.chain.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Certificates addressed by primary domain and the full domain set
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn get(&self, primary: &str, domains: &[String]) -> Result<CertificateBundle>;

    async fn put(&self, primary: &str, domains: &[String], chain: &[u8], key: &[u8]) -> Result<()>;
}

/// Storage key of a certificate: hex SHA-256 over the primary domain and the
/// sorted, deduplicated domain set. Domain order does not matter.
pub fn certificate_key(primary: &str, domains: &[String]) -> String {
    let sorted: BTreeSet<&str> = domains.iter().map(String::as_str).collect();

    let mut hasher = Sha256::new();
    hasher.update(primary.as_bytes());
    for domain in sorted {
        hasher.update(b"\n");
        hasher.update(domain.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Writes `<key>.crt` and `<key>.key` through a [`FileStorage`]
#[derive(Clone)]
pub struct FileCertificateStore {
    storage: Arc<dyn FileStorage>,
}

impl FileCertificateStore {
    pub fn new(storage: Arc<dyn FileStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl CertificateStore for FileCertificateStore {
    async fn get(&self, primary: &str, domains: &[String]) -> Result<CertificateBundle> {
        let key = certificate_key(primary, domains);
        let chain = self.storage.read(&format!("{}.crt", key)).await?;
        let private_key = self.storage.read(&format!("{}.key", key)).await?;
        Ok(CertificateBundle { chain, key: private_key })
    }

    async fn put(&self, primary: &str, domains: &[String], chain: &[u8], key: &[u8]) -> Result<()> {
        let name = certificate_key(primary, domains);
        // key first, a chain without its key would look like a valid certificate
        self.storage.write(&format!("{}.key", name), key).await?;
        self.storage.write(&format!("{}.crt", name), chain).await?;

        info!(primary_domain = %primary, domains = ?domains, storage_key = %name, "Stored certificate");
        Ok(())
    }
}
