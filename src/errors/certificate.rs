use thiserror::Error;

/// Failures while decoding stored certificate material.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// No certificates were found in the PEM chain.
    #[error("certificate chain does not contain any certificates")]
    EmptyCertificateChain,

    /// The certificate PEM contents were invalid or unreadable.
    #[error("certificate chain is not a valid PEM: {source}")]
    InvalidCertificatePem {
        #[source]
        source: anyhow::Error,
    },

    /// The private key PEM contents were invalid or unsupported.
    #[error("private key is not a supported PEM private key")]
    InvalidPrivateKey {
        #[source]
        source: Option<anyhow::Error>,
    },

    /// The private key does not belong to the leaf certificate.
    #[error("private key does not match the leaf certificate")]
    KeyMismatch,

    /// The leaf certificate could not be parsed as X.509.
    #[error("failed to parse leaf certificate: {source}")]
    CertificateMetadata {
        #[source]
        source: anyhow::Error,
    },
}
