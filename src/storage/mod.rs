//! # Storage
//!
//! Persistence for certificates and ACME account credentials. Everything the
//! control plane keeps across restarts is a small named blob, so the storage
//! layer is a flat key/value interface with disk, bucket and in-memory
//! backends.

pub mod certificate;
pub mod object;

pub use certificate::{certificate_key, CertificateBundle, CertificateStore, FileCertificateStore};
pub use object::{ObjectClient, ObjectStorage, S3Client};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::{Error, Result};

/// Flat, named blob storage.
///
/// Names are plain file names without directories. Implementations must not
/// log the stored contents, they include private keys.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Read a blob. A missing blob is a [`Error::Storage`] with `NotFound` kind.
    async fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Create or replace a blob.
    async fn write(&self, name: &str, data: &[u8]) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool>;
}

/// Stores every blob as a file with mode 0600 below one directory
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(directory: impl AsRef<str>) -> Self {
        let directory = directory.as_ref();
        let trimmed = directory.trim_end_matches('/');
        // keep "/" itself addressable
        let root = if trimmed.is_empty() && !directory.is_empty() { "/" } else { trimmed };
        Self { root: PathBuf::from(root) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Error::validation_field(format!("invalid storage name '{}'", name), "name"));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl FileStorage for DiskStorage {
    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_of(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::storage(format!("failed to read {}", path.display()), e))
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path_of(name)?;
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::storage(format!("failed to create directory {}", self.root.display()), e)
        })?;

        // write next to the target and rename, readers never see a partial file
        let staging = self.root.join(format!(".{}.tmp", name));
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&staging)
            .await
            .map_err(|e| Error::storage(format!("failed to open {}", staging.display()), e))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::storage(format!("failed to write {}", staging.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::storage(format!("failed to flush {}", staging.display()), e))?;
        drop(file);

        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| Error::storage(format!("failed to replace {}", path.display()), e))?;

        debug!(path = %path.display(), bytes = data.len(), "Stored file");
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path_of(name)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::storage(format!("failed to stat {}", path.display()), e))
    }
}

/// In-memory storage, shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl FileStorage for MemoryStorage {
    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.files.get(name).map(|entry| entry.value().clone()).ok_or_else(|| {
            Error::storage(
                format!("failed to read {}", name),
                io::Error::new(io::ErrorKind::NotFound, "no such file"),
            )
        })
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        self.files.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.files.contains_key(name))
    }
}

/// Whether `error` reports a missing blob
pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Storage { source, .. } if source.kind() == io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        assert_eq!(DiskStorage::new("/var/lib/edgeplane/").root(), Path::new("/var/lib/edgeplane"));
        assert_eq!(DiskStorage::new("/var/lib/edgeplane").root(), Path::new("/var/lib/edgeplane"));
        assert_eq!(DiskStorage::new("/").root(), Path::new("/"));
    }

    #[tokio::test]
    async fn disk_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(format!("{}/", dir.path().display()));

        assert!(!storage.exists("a.crt").await.unwrap());
        storage.write("a.crt", b"first").await.unwrap();
        storage.write("a.crt", b"second").await.unwrap();

        assert!(storage.exists("a.crt").await.unwrap());
        assert_eq!(storage.read("a.crt").await.unwrap(), b"second");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn disk_storage_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path().to_string_lossy());
        storage.write("a.key", b"secret").await.unwrap();

        let mode = std::fs::metadata(dir.path().join("a.key")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn disk_storage_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path().join("nested/certs").to_string_lossy());
        storage.write("a.crt", b"pem").await.unwrap();
        assert_eq!(storage.read("a.crt").await.unwrap(), b"pem");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskStorage::new(dir.path().to_string_lossy());
        let memory = MemoryStorage::new();

        assert!(is_not_found(&disk.read("missing").await.unwrap_err()));
        assert!(is_not_found(&memory.read("missing").await.unwrap_err()));
    }

    #[tokio::test]
    async fn names_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path().to_string_lossy());
        assert!(storage.write("../escape", b"x").await.is_err());
        assert!(storage.read("").await.is_err());
    }

    #[tokio::test]
    async fn memory_storage_clones_share_state() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();
        clone.write("x", b"1").await.unwrap();
        assert_eq!(storage.read("x").await.unwrap(), b"1");
        assert_eq!(storage.len(), 1);
    }
}
