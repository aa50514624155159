// projectbackup/src/storage/memory.rs
//! In-memory backend used by the test suite.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Storage, StorageResult};
use crate::errors::StorageError;

#[derive(Debug, Default)]
struct State {
    directories: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    put_attempts: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
    failing_files: BTreeSet<String>,
    fail_listing: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `put_file` whose target ends with `/<file_name>` fails.
    pub fn failing_on(mut self, file_name: &str) -> Self {
        self.failing_files.insert(file_name.to_string());
        self
    }

    /// Every `list_directories` call fails.
    pub fn with_broken_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn directories(&self) -> Vec<String> {
        self.lock().directories.iter().cloned().collect()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn put_attempts(&self, path: &str) -> usize {
        self.lock().put_attempts.get(path).copied().unwrap_or(0)
    }

    fn insert_directory_chain(state: &mut State, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            state.directories.insert(current.clone());
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let state = self.lock();
        Ok(state.directories.contains(path) || state.files.contains_key(path))
    }

    async fn make_directory(&self, path: &str) -> StorageResult<()> {
        Self::insert_directory_chain(&mut self.lock(), path);
        Ok(())
    }

    async fn list_directories(&self, prefix: &str) -> StorageResult<Vec<String>> {
        if self.fail_listing {
            return Err(StorageError::remote(prefix, "listing unavailable"));
        }
        let state = self.lock();
        if !state.directories.contains(prefix) {
            return Err(StorageError::NotFound(prefix.to_string()));
        }
        let needle = format!("{prefix}/");
        Ok(state
            .directories
            .iter()
            .filter(|d| d.strip_prefix(&needle).is_some_and(|rest| !rest.contains('/')))
            .cloned()
            .collect())
    }

    async fn delete_directory(&self, path: &str) -> StorageResult<()> {
        let mut state = self.lock();
        let needle = format!("{path}/");
        state
            .directories
            .retain(|d| d != path && !d.starts_with(&needle));
        state.files.retain(|f, _| !f.starts_with(&needle));
        Ok(())
    }

    async fn put_file(&self, path: &str, source: &Path) -> StorageResult<()> {
        *self.lock().put_attempts.entry(path.to_string()).or_default() += 1;

        let file_name = path.rsplit('/').next().unwrap_or(path);
        if self.failing_files.contains(file_name) {
            return Err(StorageError::remote(path, "simulated upload failure"));
        }

        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| StorageError::io(source.display().to_string(), e))?;
        let mut state = self.lock();
        if let Some((parent, _)) = path.rsplit_once('/') {
            Self::insert_directory_chain(&mut state, parent);
        }
        state.files.insert(path.to_string(), bytes);
        Ok(())
    }
}
