use anyhow::anyhow;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rcgen::KeyPair;
use rustls::pki_types::{pem::PemObject, CertificateDer};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::errors::CertificateError;

/// Metadata extracted from the leaf certificate of a stored chain.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
}

impl CertificateInfo {
    /// Whether the leaf expires before `now + window`
    pub fn expires_within(&self, window: TimeDelta, now: DateTime<Utc>) -> bool {
        now + window > self.not_after
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }
}

/// Decode a PEM chain and private key and return the leaf metadata.
///
/// The key must be a PKCS#8 private key whose public half matches the leaf.
pub fn parse_certificate_info(
    chain_pem: &[u8],
    key_pem: &[u8],
) -> Result<CertificateInfo, CertificateError> {
    let leaf = leaf_certificate(chain_pem)?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|err| CertificateError::CertificateMetadata { source: anyhow!(err) })?;

    let key = private_key(key_pem)?;
    if key.public_key_raw() != cert.public_key().subject_public_key.data.as_ref() {
        return Err(CertificateError::KeyMismatch);
    }

    leaf_info(&cert)
}

/// A chain is usable when it parses and the leaf has not expired yet
pub fn is_cert_usable(chain_pem: &[u8], key_pem: &[u8], now: DateTime<Utc>) -> bool {
    matches!(parse_certificate_info(chain_pem, key_pem), Ok(info) if !info.is_expired(now))
}

fn leaf_certificate(chain_pem: &[u8]) -> Result<CertificateDer<'static>, CertificateError> {
    let mut chain: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(chain_pem)
        .map(|result| {
            result.map_err(|err| CertificateError::InvalidCertificatePem { source: anyhow!(err) })
        })
        .collect::<Result<_, _>>()?;

    if chain.is_empty() {
        return Err(CertificateError::EmptyCertificateChain);
    }

    Ok(chain.remove(0))
}

fn private_key(key_pem: &[u8]) -> Result<KeyPair, CertificateError> {
    let pem = std::str::from_utf8(key_pem)
        .map_err(|err| CertificateError::InvalidPrivateKey { source: Some(anyhow!(err)) })?;
    KeyPair::from_pem(pem)
        .map_err(|err| CertificateError::InvalidPrivateKey { source: Some(anyhow!(err)) })
}

fn leaf_info(cert: &X509Certificate<'_>) -> Result<CertificateInfo, CertificateError> {
    let validity = cert.validity();
    let not_before = timestamp(validity.not_before.timestamp())?;
    let not_after = timestamp(validity.not_after.timestamp())?;

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push(dns.to_string());
            }
        }
    }

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
        dns_names,
    })
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>, CertificateError> {
    Utc.timestamp_opt(seconds, 0).single().ok_or_else(|| CertificateError::CertificateMetadata {
        source: anyhow!("certificate validity timestamp {} is out of range", seconds),
    })
}
