// projectbackup/src/backup/upload.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{BackupError, Result};
use crate::reporter::Reporter;
use crate::storage::{Storage, join_path};

const STAGE: &str = "upload";

/// How often a single file is tried before the uploader gives up on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause before the second pass; doubled for every later pass.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUpload {
    pub file_name: String,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: Vec<String>,
    pub failed: Vec<FailedUpload>,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Moves every file in the workspace to `target_dir` on the destination.
#[derive(Debug, Clone, Default)]
pub struct Uploader {
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Uploads the regular files directly under `workspace` (no recursion),
    /// deleting each local copy as soon as its upload succeeded.
    ///
    /// A failed file stays in place and is retried on the next pass. Passes
    /// repeat with exponential backoff until the workspace is empty or every
    /// remaining file has used up its attempts; those are returned in
    /// `UploadReport::failed` rather than as an error.
    pub async fn upload(
        &self,
        workspace: &Path,
        storage: &dyn Storage,
        target_dir: &str,
        reporter: &dyn Reporter,
    ) -> Result<UploadReport> {
        storage.make_directory(target_dir).await?;

        let mut report = UploadReport::default();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut last_errors: HashMap<String, String> = HashMap::new();
        let mut backoff = self.policy.initial_backoff;
        let mut pass = 0u32;

        loop {
            let pending: Vec<(String, PathBuf)> = workspace_files(workspace)?
                .into_iter()
                .filter(|(name, _)| {
                    attempts.get(name).copied().unwrap_or(0) < self.policy.max_attempts
                })
                .collect();
            if pending.is_empty() {
                break;
            }

            if pass > 0 {
                reporter.info(
                    STAGE,
                    &format!(
                        "Retrying {} file(s) in {} ms",
                        pending.len(),
                        backoff.as_millis()
                    ),
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            pass += 1;

            for (file_name, path) in pending {
                let attempt = {
                    let counter = attempts.entry(file_name.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                };
                let destination = join_path(&[target_dir, &file_name]);

                match storage.put_file(&destination, &path).await {
                    Ok(()) => {
                        tokio::fs::remove_file(&path)
                            .await
                            .map_err(|e| BackupError::Workspace {
                                path: path.clone(),
                                source: e,
                            })?;
                        reporter.info(STAGE, &format!("✓ Uploaded {}", destination));
                        last_errors.remove(&file_name);
                        report.uploaded.push(file_name);
                    }
                    Err(e) => {
                        reporter.error(
                            STAGE,
                            &format!(
                                "Failed to upload {} (attempt {}/{}): {}",
                                file_name, attempt, self.policy.max_attempts, e
                            ),
                        );
                        last_errors.insert(file_name, e.to_string());
                    }
                }
            }
        }

        let mut failed: Vec<FailedUpload> = last_errors
            .into_iter()
            .map(|(file_name, last_error)| FailedUpload {
                attempts: attempts.get(&file_name).copied().unwrap_or(0),
                file_name,
                last_error,
            })
            .collect();
        failed.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        for failure in &failed {
            reporter.error(
                STAGE,
                &format!(
                    "Giving up on {} after {} attempt(s): {}",
                    failure.file_name, failure.attempts, failure.last_error
                ),
            );
        }
        report.failed = failed;
        Ok(report)
    }
}

/// Regular files directly under `workspace`, sorted by name.
fn workspace_files(workspace: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(workspace).map_err(|e| BackupError::Workspace {
        path: workspace.to_path_buf(),
        source: e,
    })? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{CapturingReporter, Level, NullReporter};
    use crate::storage::memory::MemoryStorage;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn uploads_every_file_and_empties_workspace() -> anyhow::Result<()> {
        let workspace = tempfile::tempdir()?;
        std::fs::write(workspace.path().join("a.zip"), b"first part")?;
        std::fs::write(workspace.path().join("b.zip.001"), b"second part")?;
        std::fs::create_dir(workspace.path().join("nested"))?;
        let storage = MemoryStorage::new();

        let report = Uploader::new(quick_policy(3))
            .upload(workspace.path(), &storage, "backups/backup_1", &NullReporter)
            .await?;

        assert!(report.is_complete());
        assert_eq!(report.uploaded, vec!["a.zip", "b.zip.001"]);
        assert_eq!(
            storage.files(),
            vec!["backups/backup_1/a.zip", "backups/backup_1/b.zip.001"]
        );
        assert_eq!(storage.file("backups/backup_1/a.zip").as_deref(), Some(&b"first part"[..]));
        assert_eq!(
            storage.file("backups/backup_1/b.zip.001").as_deref(),
            Some(&b"second part"[..])
        );
        assert!(!workspace.path().join("a.zip").exists());
        assert!(!workspace.path().join("b.zip.001").exists());
        assert!(workspace.path().join("nested").exists());
        Ok(())
    }

    #[tokio::test]
    async fn one_failing_file_does_not_stop_the_others() -> anyhow::Result<()> {
        let workspace = tempfile::tempdir()?;
        for name in ["1.z01", "1.z02", "1.zip"] {
            std::fs::write(workspace.path().join(name), name.as_bytes())?;
        }
        let storage = MemoryStorage::new().failing_on("1.z02");
        let reporter = CapturingReporter::new();

        let report = Uploader::new(quick_policy(3))
            .upload(workspace.path(), &storage, "backups/backup_1", &reporter)
            .await?;

        assert_eq!(report.uploaded, vec!["1.z01", "1.zip"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].file_name, "1.z02");
        assert_eq!(report.failed[0].attempts, 3);
        assert_eq!(storage.put_attempts("backups/backup_1/1.z02"), 3);

        assert!(!workspace.path().join("1.z01").exists());
        assert!(!workspace.path().join("1.zip").exists());
        assert!(workspace.path().join("1.z02").exists());
        assert!(reporter
            .messages(Level::Error)
            .iter()
            .any(|m| m.contains("Giving up on 1.z02")));
        Ok(())
    }

    #[tokio::test]
    async fn target_directory_exists_even_for_empty_workspace() -> anyhow::Result<()> {
        let workspace = tempfile::tempdir()?;
        let storage = MemoryStorage::new();

        let report = Uploader::new(quick_policy(1))
            .upload(workspace.path(), &storage, "backups/backup_1", &NullReporter)
            .await?;

        assert!(report.uploaded.is_empty());
        assert!(storage.exists("backups/backup_1").await?);
        Ok(())
    }
}
