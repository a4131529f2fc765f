//! S3 compatible object storage
//!
//! Certificates and account credentials can be shared between control plane
//! replicas through a bucket. The local [`DiskStorage`] directory stays the
//! first place every read looks at; a miss downloads the object and keeps a
//! copy on disk. Writes land on disk first and are then uploaded.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode, Url};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{is_not_found, DiskStorage, FileStorage};
use crate::config::ObjectStorageConfig;
use crate::errors::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Deadline of one object operation unless configured otherwise
pub const DEFAULT_OBJECT_TIMEOUT: Duration = Duration::from_secs(3);

const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Remote half of [`ObjectStorage`]
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Download an object. A missing object is `Ok(None)`.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()>;
}

/// [`FileStorage`] backed by a bucket, cached in a local directory
pub struct ObjectStorage {
    client: Arc<dyn ObjectClient>,
    cache: DiskStorage,
    timeout: Duration,
}

impl ObjectStorage {
    pub fn new(client: Arc<dyn ObjectClient>, cache: DiskStorage) -> Self {
        Self { client, cache, timeout: DEFAULT_OBJECT_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn within<T>(&self, operation: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| Error::timeout(operation, self.timeout.as_millis() as u64))?
    }
}

#[async_trait]
impl FileStorage for ObjectStorage {
    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        match self.cache.read(name).await {
            Ok(data) => return Ok(data),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e),
        }

        let fetched = self.within("object download", self.client.get_object(name)).await?;
        let Some(data) = fetched else {
            return Err(Error::storage(
                format!("object {} does not exist", name),
                io::Error::new(io::ErrorKind::NotFound, "no such object"),
            ));
        };

        self.cache.write(name, &data).await?;
        debug!(name = %name, bytes = data.len(), "Cached object from the bucket");
        Ok(data)
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        self.cache.write(name, data).await?;
        self.within("object upload", self.client.put_object(name, data.to_vec())).await?;
        debug!(name = %name, bytes = data.len(), "Uploaded object to the bucket");
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        match self.read(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Keys used to sign requests with AWS Signature Version 4
#[derive(Clone)]
pub struct SigningCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl SigningCredentials {
    fn scope(&self, timestamp: DateTime<Utc>) -> String {
        format!("{}/{}/{}/aws4_request", timestamp.format("%Y%m%d"), self.region, SERVICE)
    }

    fn signing_key(&self, timestamp: DateTime<Utc>, service: &str) -> Result<Vec<u8>> {
        let date = timestamp.format("%Y%m%d").to_string();
        let secret = format!("AWS4{}", self.secret_key);
        let date_key = hmac_sha256(secret.as_bytes(), date.as_bytes())?;
        let region_key = hmac_sha256(&date_key, self.region.as_bytes())?;
        let service_key = hmac_sha256(&region_key, service.as_bytes())?;
        hmac_sha256(&service_key, b"aws4_request")
    }

    /// `Authorization` header value for a request whose signed headers are
    /// `headers` (lowercase names)
    fn authorization(
        &self,
        method: &str,
        path: &str,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<String> {
        let canonical_headers: String =
            headers.iter().map(|(name, value)| format!("{}:{}\n", name, value.trim())).collect();
        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, path, canonical_headers, signed_headers, payload_hash
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            SIGNING_ALGORITHM,
            timestamp.format("%Y%m%dT%H%M%SZ"),
            self.scope(timestamp),
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = self.signing_key(timestamp, SERVICE)?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);
        Ok(format!(
            "{} Credential={}/{},SignedHeaders={},Signature={}",
            SIGNING_ALGORITHM,
            self.access_key,
            self.scope(timestamp),
            signed_headers,
            signature
        ))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::internal(format!("Invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode everything but the unreserved characters
fn uri_encode(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

/// Path style S3 client (`<endpoint>/<bucket>/<key>`), which MinIO serves too
pub struct S3Client {
    http: Client,
    endpoint: Url,
    bucket: String,
    credentials: SigningCredentials,
}

impl S3Client {
    pub fn from_config(config: &ObjectStorageConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            Error::config(format!("Invalid object storage endpoint {}: {}", config.endpoint, e))
        })?;
        let http = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| Error::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            bucket: config.bucket.clone(),
            credentials: SigningCredentials {
                access_key: config.access_key.clone(),
                secret_key: config.secret_key.clone(),
                region: config.region.clone(),
            },
        })
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let raw = format!("{}/{}/{}", base, uri_encode(&self.bucket), uri_encode(key));
        Url::parse(&raw).map_err(|e| {
            Error::validation_field(format!("invalid object key {}: {}", key, e), "key")
        })
    }

    async fn send(&self, method: Method, key: &str, body: Vec<u8>) -> Result<reqwest::Response> {
        let url = self.object_url(key)?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(Error::config("Object storage endpoint has no host")),
        };

        let now = Utc::now();
        let payload_hash = hex::encode(Sha256::digest(&body));
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let headers = BTreeMap::from([
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ]);
        let authorization = self.credentials.authorization(
            method.as_str(),
            url.path(),
            &headers,
            &payload_hash,
            now,
        )?;

        self.http
            .request(method, url)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date)
            .header("authorization", authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let context = format!("object storage request for {} failed", key);
                Error::storage(context, io::Error::other(e))
            })
    }
}

fn status_error(operation: &str, key: &str, status: StatusCode) -> Error {
    Error::storage(
        format!("object {} of {} returned {}", operation, key, status),
        io::Error::other(format!("unexpected status {}", status)),
    )
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self.send(Method::GET, key, Vec::new()).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.bytes().await.map_err(|e| {
                    Error::storage(format!("failed to download {}", key), io::Error::other(e))
                })?;
                Ok(Some(body.to_vec()))
            }
            status => Err(status_error("download", key, status)),
        }
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let response = self.send(Method::PUT, key, body).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error("upload", key, status));
        }
        Ok(())
    }
}
