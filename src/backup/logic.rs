// projectbackup/src/backup/logic.rs
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use fs4::fs_std::FileExt;
use tempfile::TempDir;
use tracing::Instrument;

use super::archive::{ArchiveBuilder, ArchivePart, PartsSize};
use super::db_dump::{DatabaseDumper, DumpArtifact};
use super::exclusions::compute_exclusions;
use super::retention;
use super::upload::{RetryPolicy, UploadReport, Uploader};
use crate::config::BackupConfig;
use crate::errors::{BackupError, Result};
use crate::reporter::Reporter;
use crate::storage::{Storage, join_path};

/// Directory under `temp_path` holding run workspaces and the run lock.
pub const WORKSPACE_ROOT_DIR: &str = "backup-temp";
/// Directory under the project root receiving the database dump.
pub const DUMP_DIR: &str = "db-dumps";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Identity of one backup execution, fixed at construction.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub timestamp: String,
    pub backup_name: String,
    pub base_path: PathBuf,
    pub base_name: String,
    pub retention_count: usize,
    pub workspace_root: PathBuf,
}

impl BackupRun {
    pub fn new(config: &BackupConfig, now: DateTime<Local>) -> Self {
        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
        Self {
            backup_name: format!("backup_{}", timestamp),
            timestamp,
            base_path: config.base_path.clone(),
            base_name: config.base_name.clone(),
            retention_count: config.backup_count,
            workspace_root: config.temp_path.join(WORKSPACE_ROOT_DIR),
        }
    }

    /// `<base_name>/<backup_name>` on the destination.
    pub fn target_dir(&self) -> String {
        join_path(&[&self.base_name, &self.backup_name])
    }

    fn archive_file_name(&self) -> String {
        format!("{}.zip", self.timestamp)
    }

    fn lock_path(&self) -> PathBuf {
        self.workspace_root.join(format!("{}.lock", self.base_name))
    }
}

/// What a finished run did.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub backup_name: String,
    pub target_dir: String,
    pub pruned: Option<String>,
    pub dump: Option<DumpArtifact>,
    pub parts: Vec<ArchivePart>,
    pub upload: UploadReport,
}

impl BackupReport {
    /// Every produced file reached the destination.
    pub fn is_complete(&self) -> bool {
        self.upload.is_complete()
    }
}

/// Sequences retention, dump, archive and upload for one run and owns the
/// temporary workspace in between.
pub struct BackupOrchestrator {
    run: BackupRun,
    storage: Arc<dyn Storage>,
    reporter: Arc<dyn Reporter>,
    archiver: ArchiveBuilder,
    dumper: Option<DatabaseDumper>,
    uploader: Uploader,
    parts_size: PartsSize,
    exclude_directories: Vec<String>,
}

impl BackupOrchestrator {
    /// Checks every precondition (tools present, settings usable) without
    /// touching the destination or the filesystem.
    pub fn new(
        config: &BackupConfig,
        storage: Arc<dyn Storage>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        if config.base_name.trim().is_empty() {
            return Err(BackupError::Configuration("base_name must not be empty".to_string()));
        }
        if config.disk_name.trim().is_empty() {
            return Err(BackupError::Configuration("disk must not be empty".to_string()));
        }
        if config.backup_count == 0 {
            return Err(BackupError::Configuration(
                "backup_count must be at least 1".to_string(),
            ));
        }

        let archiver = ArchiveBuilder::new(config.zip_binary.as_deref())?;
        let parts_size = PartsSize::parse(&config.parts_size)?;
        let dumper = match &config.connection {
            Some(connection) => Some(DatabaseDumper::new(connection.clone(), config.compress_dump)?),
            None => None,
        };
        let uploader = Uploader::new(RetryPolicy {
            max_attempts: config.upload_max_attempts.max(1),
            initial_backoff: config.upload_backoff,
        });

        Ok(Self {
            run: BackupRun::new(config, Local::now()),
            storage,
            reporter,
            archiver,
            dumper,
            uploader,
            parts_size,
            exclude_directories: config.exclude_directories.clone(),
        })
    }

    #[cfg(test)]
    fn with_dumper(mut self, dumper: DatabaseDumper) -> Self {
        self.dumper = Some(dumper);
        self
    }

    pub fn run_info(&self) -> &BackupRun {
        &self.run
    }

    /// Executes the pipeline once.
    ///
    /// The workspace and the dump scratch directory are gone when this
    /// returns, whatever the outcome. If the future is dropped mid-run the
    /// same guards clean up on drop.
    pub async fn run(self) -> Result<BackupReport> {
        let span = tracing::info_span!("backup", name = %self.run.backup_name);
        self.run_in_span().instrument(span).await
    }

    async fn run_in_span(self) -> Result<BackupReport> {
        let reporter = Arc::clone(&self.reporter);
        let base_path = fs::canonicalize(&self.run.base_path).map_err(|e| {
            BackupError::Configuration(format!(
                "base_path {} is not accessible: {}",
                self.run.base_path.display(),
                e
            ))
        })?;
        if !base_path.is_dir() {
            return Err(BackupError::Configuration(format!(
                "base_path {} is not a directory",
                base_path.display()
            )));
        }

        let _lock = RunLock::acquire(&self.run.workspace_root, &self.run.lock_path())?;
        let workspace = Workspace::create(&self.run.workspace_root, &self.run.backup_name)?;
        let mut scratch = DumpScratch::new(base_path.join(DUMP_DIR));

        reporter.info(
            "run",
            &format!(
                "Starting {} of {} into {}",
                self.run.backup_name,
                base_path.display(),
                self.run.target_dir()
            ),
        );

        let outcome = self.execute(&base_path, workspace.path(), &mut scratch).await;

        scratch.cleanup(reporter.as_ref());
        workspace.close(reporter.as_ref());

        match &outcome {
            Ok(report) if report.is_complete() => {
                reporter.info("run", &format!("✅ {} completed", report.backup_name));
            }
            Ok(report) => reporter.error(
                "run",
                &format!(
                    "{} finished with {} file(s) not uploaded",
                    report.backup_name,
                    report.upload.failed.len()
                ),
            ),
            Err(e) => reporter.error(e.stage(), &format!("Backup aborted: {}", e)),
        }
        outcome
    }

    async fn execute(
        &self,
        base_path: &Path,
        workspace: &Path,
        scratch: &mut DumpScratch,
    ) -> Result<BackupReport> {
        let storage = self.storage.as_ref();
        let reporter = self.reporter.as_ref();

        if !storage.exists(&self.run.base_name).await? {
            storage.make_directory(&self.run.base_name).await?;
        }

        let pruned = retention::prune(
            storage,
            &self.run.base_name,
            self.run.retention_count,
            reporter,
        )
        .await?;

        let dump = match &self.dumper {
            Some(dumper) => {
                scratch.track(dumper.output_path(scratch.path()));
                Some(dumper.dump(scratch.path(), reporter).await?)
            }
            None => None,
        };

        // Excludes every workspace plus the run lock, not only this run's workspace.
        let workspace_root = resolve(&self.run.workspace_root);
        let local_root = storage.local_root().map(resolve);
        let exclusions = compute_exclusions(
            base_path,
            &workspace_root,
            local_root.as_deref(),
            &self.exclude_directories,
        );
        let parts = self
            .archiver
            .build(
                base_path,
                &exclusions,
                &self.parts_size,
                &workspace.join(self.run.archive_file_name()),
                reporter,
            )
            .await?;

        let target_dir = self.run.target_dir();
        let upload = self
            .uploader
            .upload(workspace, storage, &target_dir, reporter)
            .await?;

        Ok(BackupReport {
            backup_name: self.run.backup_name.clone(),
            target_dir,
            pruned,
            dump,
            parts,
            upload,
        })
    }
}

fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Advisory lock keeping two runs for the same `base_name` apart.
/// Released when dropped.
struct RunLock {
    _file: File,
}

impl RunLock {
    fn acquire(workspace_root: &Path, path: &Path) -> Result<Self> {
        fs::create_dir_all(workspace_root).map_err(|e| BackupError::Workspace {
            path: workspace_root.to_path_buf(),
            source: e,
        })?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| BackupError::Workspace {
                path: path.to_path_buf(),
                source: e,
            })?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(true) => Ok(Self { _file: file }),
            Ok(false) => Err(BackupError::AlreadyRunning(path.to_path_buf())),
            Err(e) => Err(BackupError::Workspace {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

/// Exclusively owned scratch directory for one run. Removed on `close` or drop.
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn create(root: &Path, backup_name: &str) -> Result<Self> {
        let root = resolve(root);
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", backup_name))
            .tempdir_in(&root)
            .map_err(|e| BackupError::Workspace { path: root, source: e })?;
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn close(self, reporter: &dyn Reporter) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => reporter.info("cleanup", &format!("Removed workspace {}", path.display())),
            Err(e) => reporter.error(
                "cleanup",
                &format!("Failed to remove workspace {}: {}", path.display(), e),
            ),
        }
    }
}

/// The dump directory inside the project root.
///
/// Only the dump file written by this run is deleted, and the directory
/// itself only when this run created it, so a pre-existing `db-dumps`
/// directory belonging to the project is left alone.
struct DumpScratch {
    dir: PathBuf,
    created: bool,
    files: Vec<PathBuf>,
}

impl DumpScratch {
    fn new(dir: PathBuf) -> Self {
        let created = !dir.exists();
        Self {
            dir,
            created,
            files: Vec::new(),
        }
    }

    fn path(&self) -> &Path {
        &self.dir
    }

    fn track(&mut self, file: PathBuf) {
        self.files.push(file);
    }

    fn remove(&mut self) -> std::io::Result<()> {
        for file in self.files.drain(..) {
            match fs::remove_file(&file) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        if self.created && self.dir.exists() {
            fs::remove_dir(&self.dir)?;
        }
        self.created = false;
        Ok(())
    }

    fn cleanup(&mut self, reporter: &dyn Reporter) {
        if let Err(e) = self.remove() {
            reporter.error(
                "cleanup",
                &format!("Failed to remove dump directory {}: {}", self.dir.display(), e),
            );
        }
    }
}

impl Drop for DumpScratch {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskConfig, parse_connection_url};
    use crate::reporter::{CapturingReporter, Level};
    use crate::storage::memory::MemoryStorage;
    use std::time::Duration;

    struct Fixture {
        project: TempDir,
        temp: TempDir,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let project = tempfile::tempdir()?;
            fs::create_dir(project.path().join("src"))?;
            fs::write(project.path().join("src/app.txt"), b"application")?;
            fs::create_dir(project.path().join("vendor"))?;
            fs::write(project.path().join("vendor/dep.txt"), b"dependency")?;
            Ok(Self {
                project,
                temp: tempfile::tempdir()?,
            })
        }

        fn config(&self, zip_binary: Option<PathBuf>) -> BackupConfig {
            BackupConfig {
                exclude_directories: vec!["vendor/".to_string()],
                disk_name: "memory".to_string(),
                disk: DiskConfig::Local {
                    root: self.temp.path().join("unused"),
                },
                connection: None,
                base_name: "backups".to_string(),
                base_path: self.project.path().to_path_buf(),
                temp_path: self.temp.path().to_path_buf(),
                parts_size: "1m".to_string(),
                backup_count: 2,
                zip_binary,
                compress_dump: true,
                upload_max_attempts: 2,
                upload_backoff: Duration::from_millis(1),
            }
        }

        fn workspace_entries(&self) -> anyhow::Result<Vec<String>> {
            let root = self.temp.path().join(WORKSPACE_ROOT_DIR);
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut names = Vec::new();
            for entry in fs::read_dir(root)? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".lock") {
                    names.push(name);
                }
            }
            Ok(names)
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> anyhow::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}"))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[test]
    fn run_identity_uses_fixed_width_timestamp() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let now = chrono::TimeZone::with_ymd_and_hms(&Local, 2024, 3, 5, 7, 8, 9)
            .single()
            .ok_or_else(|| anyhow::anyhow!("ambiguous local time"))?;

        let run = BackupRun::new(&fixture.config(None), now);
        assert_eq!(run.timestamp, "20240305070809");
        assert_eq!(run.backup_name, "backup_20240305070809");
        assert_eq!(run.target_dir(), "backups/backup_20240305070809");
        assert_eq!(run.archive_file_name(), "20240305070809.zip");
        Ok(())
    }

    #[test]
    fn missing_zip_is_a_configuration_error() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let config = fixture.config(Some(PathBuf::from("/nonexistent/zip")));

        let result = BackupOrchestrator::new(
            &config,
            Arc::new(MemoryStorage::new()),
            Arc::new(CapturingReporter::new()),
        );
        assert!(matches!(result, Err(BackupError::Configuration(_))));
        assert!(fixture.workspace_entries()?.is_empty());
        Ok(())
    }

    #[test]
    fn invalid_parts_size_is_a_configuration_error() -> anyhow::Result<()> {
        let Ok(true_bin) = which::which("true") else {
            return Ok(());
        };
        let fixture = Fixture::new()?;
        let mut config = fixture.config(Some(true_bin));
        config.parts_size = "lots".to_string();

        let result = BackupOrchestrator::new(
            &config,
            Arc::new(MemoryStorage::new()),
            Arc::new(CapturingReporter::new()),
        );
        assert!(matches!(result, Err(BackupError::Configuration(_))));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn archive_failure_aborts_before_upload_and_cleans_workspace() -> anyhow::Result<()> {
        let Ok(false_bin) = which::which("false") else {
            return Ok(());
        };
        let fixture = Fixture::new()?;
        let storage = Arc::new(MemoryStorage::new());
        let reporter = Arc::new(CapturingReporter::new());

        let orchestrator =
            BackupOrchestrator::new(&fixture.config(Some(false_bin)), storage.clone(), reporter.clone())?;
        let target_dir = orchestrator.run_info().target_dir();
        let result = orchestrator.run().await;

        assert!(matches!(result, Err(BackupError::ArchiveCommandFailed { .. })));
        assert!(!storage.exists(&target_dir).await?);
        assert!(storage.files().is_empty());
        assert!(fixture.workspace_entries()?.is_empty());
        assert!(reporter.error_stages().contains(&"archive".to_string()));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dump_failure_aborts_before_archive() -> anyhow::Result<()> {
        let (Ok(false_bin), Ok(true_bin)) = (which::which("false"), which::which("true")) else {
            return Ok(());
        };
        let fixture = Fixture::new()?;
        let storage = Arc::new(MemoryStorage::new());
        let reporter = Arc::new(CapturingReporter::new());
        let connection = parse_connection_url("postgres://postgres@localhost/app")?;

        let orchestrator =
            BackupOrchestrator::new(&fixture.config(Some(true_bin)), storage.clone(), reporter.clone())?
                .with_dumper(DatabaseDumper::with_tool(connection, false_bin, true));
        let result = orchestrator.run().await;

        assert!(matches!(result, Err(BackupError::DumpFailed(_))));
        assert!(storage.files().is_empty());
        assert!(fixture.workspace_entries()?.is_empty());
        assert!(!fixture.project.path().join(DUMP_DIR).exists());
        assert!(!reporter
            .messages(Level::Info)
            .iter()
            .any(|m| m.contains("Creating archive")));
        Ok(())
    }

    #[tokio::test]
    async fn second_concurrent_run_is_refused() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let run = BackupRun::new(&fixture.config(None), Local::now());

        let _held = RunLock::acquire(&run.workspace_root, &run.lock_path())?;
        let second = RunLock::acquire(&run.workspace_root, &run.lock_path());
        assert!(matches!(second, Err(BackupError::AlreadyRunning(_))));
        Ok(())
    }

    #[test]
    fn pre_existing_dump_directory_survives_cleanup() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let dir = fixture.project.path().join(DUMP_DIR);
        fs::create_dir(&dir)?;
        fs::write(dir.join("keep.sql"), b"user data")?;

        let mut scratch = DumpScratch::new(dir.clone());
        fs::write(dir.join("mysql-app.sql.gz"), b"dump")?;
        scratch.track(dir.join("mysql-app.sql.gz"));
        scratch.remove()?;

        assert!(dir.join("keep.sql").exists());
        assert!(!dir.join("mysql-app.sql.gz").exists());
        Ok(())
    }

    #[tokio::test]
    async fn full_run_uploads_archive_and_prunes() -> anyhow::Result<()> {
        let Ok(zip) = which::which("zip") else {
            return Ok(());
        };
        let fixture = Fixture::new()?;
        let storage = Arc::new(MemoryStorage::new());
        for name in ["backup_20230101000000", "backup_20230102000000", "backup_20230103000000"] {
            storage.make_directory(&format!("backups/{name}")).await?;
        }
        let reporter = Arc::new(CapturingReporter::new());

        let orchestrator =
            BackupOrchestrator::new(&fixture.config(Some(zip)), storage.clone(), reporter.clone())?;
        let report = orchestrator.run().await?;

        assert!(report.is_complete(), "{:?}", report.upload);
        assert_eq!(report.pruned.as_deref(), Some("backups/backup_20230101000000"));
        assert_eq!(report.parts.len(), 1);
        let uploaded = format!("{}/{}", report.target_dir, report.parts[0].file_name());
        assert!(storage.file(&uploaded).is_some());
        assert!(!storage.exists("backups/backup_20230101000000").await?);
        assert!(fixture.workspace_entries()?.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_run_removes_the_partial_dump() -> anyhow::Result<()> {
        let Ok(true_bin) = which::which("true") else {
            return Ok(());
        };
        let fixture = Fixture::new()?;
        let tools = tempfile::tempdir()?;
        let slow_dump = write_script(tools.path(), "slow-dump", "exec sleep 5\n")?;
        let connection = parse_connection_url("sqlite:///var/app/database.sqlite")?;
        let config = fixture.config(Some(true_bin));

        let orchestrator = BackupOrchestrator::new(
            &config,
            Arc::new(MemoryStorage::new()),
            Arc::new(CapturingReporter::new()),
        )?
        .with_dumper(DatabaseDumper::with_tool(connection, slow_dump, true));
        let run = BackupRun::new(&config, Local::now());

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_millis(300), orchestrator.run()).await;

        assert!(outcome.is_err(), "run should still be dumping");
        assert!(!fixture.project.path().join(DUMP_DIR).exists());
        assert!(fixture.workspace_entries()?.is_empty());
        assert!(RunLock::acquire(&run.workspace_root, &run.lock_path()).is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn archive_holds_project_and_dump_but_no_temporary_files() -> anyhow::Result<()> {
        let Ok(zip) = which::which("zip") else {
            return Ok(());
        };
        let fixture = Fixture::new()?;
        let tools = tempfile::tempdir()?;
        let dumper = write_script(
            tools.path(),
            "fake-dump",
            "echo 'CREATE TABLE notes (id INTEGER);'\n",
        )?;
        let connection = parse_connection_url("sqlite:///var/app/database.sqlite")?;
        let mut config = fixture.config(Some(zip));
        config.temp_path = fixture.project.path().join("storage");
        let storage = Arc::new(MemoryStorage::new());

        let orchestrator =
            BackupOrchestrator::new(&config, storage.clone(), Arc::new(CapturingReporter::new()))?
                .with_dumper(DatabaseDumper::with_tool(connection, dumper, true));
        let report = orchestrator.run().await?;

        assert!(report.is_complete(), "{:?}", report.upload);
        assert_eq!(report.parts.len(), 1);
        assert!(!fixture.project.path().join(DUMP_DIR).exists());

        let uploaded = format!("{}/{}", report.target_dir, report.parts[0].file_name());
        let bytes = storage
            .file(&uploaded)
            .ok_or_else(|| anyhow::anyhow!("{uploaded} was not uploaded"))?;
        let copy = tools.path().join("downloaded.zip");
        fs::write(&copy, bytes)?;

        let Some(entries) = crate::backup::archive::list_entries(&copy)? else {
            return Ok(());
        };
        assert!(entries.iter().any(|e| e == "src/app.txt"), "{entries:?}");
        assert!(
            entries.iter().any(|e| e == "db-dumps/sqlite-database.sql.gz"),
            "{entries:?}"
        );
        assert!(!entries.iter().any(|e| e.starts_with("vendor")), "{entries:?}");
        assert!(!entries.iter().any(|e| e.starts_with("storage/backup-temp/")), "{entries:?}");
        Ok(())
    }
}
