// projectbackup/src/storage/mod.rs
//! Destination storage backends.
//!
//! Paths handed to a backend are always relative, `/`-separated keys such as
//! `backups/backup_20240101000000/20240101000000.zip`. Each backend maps them
//! onto its own namespace (a directory on disk, a key prefix in a bucket).

pub(crate) mod local;
#[cfg(test)]
pub(crate) mod memory;
pub(crate) mod s3;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DiskConfig;
use crate::errors::StorageError;

pub use local::LocalStorage;
pub use s3::S3Storage;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Uniform contract every destination backend fulfils.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether a file or directory exists at `path`.
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Creates the directory at `path` (and parents). Existing directories are fine.
    async fn make_directory(&self, path: &str) -> StorageResult<()>;

    /// Immediate subdirectories of `prefix`, returned as full relative paths
    /// (`prefix/child`). Order is unspecified.
    async fn list_directories(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Removes `path` and everything below it.
    async fn delete_directory(&self, path: &str) -> StorageResult<()>;

    /// Streams the local file at `source` to `path`.
    async fn put_file(&self, path: &str, source: &Path) -> StorageResult<()>;

    /// Filesystem root of the backend when it writes to local disk.
    fn local_root(&self) -> Option<&Path> {
        None
    }
}

/// Joins relative storage path segments with `/`, skipping empty segments.
pub fn join_path(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Builds the backend described by a disk entry of the configuration.
pub async fn from_disk(disk: &DiskConfig) -> StorageResult<Arc<dyn Storage>> {
    match disk {
        DiskConfig::Local { root } => {
            let storage = LocalStorage::new(PathBuf::from(root))?;
            Ok(Arc::new(storage))
        }
        DiskConfig::S3(spaces_config) => {
            let storage = S3Storage::connect(spaces_config.clone()).await;
            Ok(Arc::new(storage))
        }
    }
}
