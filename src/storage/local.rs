// projectbackup/src/storage/local.rs
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use walkdir::WalkDir;

use super::{Storage, StorageResult};
use crate::errors::StorageError;

/// Destination on the local filesystem, rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Resolves `root` to an absolute path. Nothing is created until the
    /// first write.
    pub fn new(root: PathBuf) -> StorageResult<Self> {
        let root = std::path::absolute(&root)
            .map_err(|e| StorageError::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |acc, segment| acc.join(segment))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn make_directory(&self, path: &str) -> StorageResult<()> {
        fs::create_dir_all(self.resolve(path))
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn list_directories(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base = self.resolve(prefix);
        if !base.is_dir() {
            return Err(StorageError::NotFound(prefix.to_string()));
        }

        let mut directories = Vec::new();
        for entry in WalkDir::new(&base).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                StorageError::io(prefix, e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::other("directory walk failed")
                }))
            })?;
            if entry.file_type().is_dir() {
                let name = entry.file_name().to_string_lossy();
                directories.push(super::join_path(&[prefix, &name]));
            }
        }
        Ok(directories)
    }

    async fn delete_directory(&self, path: &str) -> StorageResult<()> {
        fs::remove_dir_all(self.resolve(path))
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn put_file(&self, path: &str, source: &Path) -> StorageResult<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(path, e))?;
        }

        let mut reader = fs::File::open(source)
            .await
            .map_err(|e| StorageError::io(source.display().to_string(), e))?;
        let mut writer = fs::File::create(&target)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        writer.sync_all().await.map_err(|e| StorageError::io(path, e))?;
        Ok(())
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}
