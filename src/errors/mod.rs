//! # Error Handling
//!
//! Error types for the edgeplane control plane, built on `thiserror`.

pub mod certificate;
pub mod types;

pub use certificate::CertificateError;
pub use types::{Error, Result};
