//! Utility functions and helpers

pub mod backoff;
pub mod certificates;

pub use backoff::Backoff;
pub use certificates::{is_cert_usable, parse_certificate_info, CertificateInfo};
