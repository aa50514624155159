pub(crate) mod archive;    // zip invocation and split parts
pub(crate) mod db_dump;    // database dump through the vendor CLI tools
pub(crate) mod exclusions; // paths left out of the archive
mod logic;                 // run identity, orchestration, workspace lifecycle
pub(crate) mod retention;  // pruning of old backup directories
pub(crate) mod upload;     // streaming upload with bounded retries

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::BackupConfig;
use crate::reporter::Reporter;
use crate::storage;

pub use logic::{BackupOrchestrator, BackupReport};

/// Public entry point for the backup process.
/// Builds the destination backend, validates preconditions and runs the pipeline once.
pub async fn run_backup_flow(
    config: &BackupConfig,
    reporter: Arc<dyn Reporter>,
) -> Result<BackupReport> {
    let storage = storage::from_disk(&config.disk)
        .await
        .with_context(|| format!("Failed to initialise disk '{}'", config.disk_name))?;

    let orchestrator = BackupOrchestrator::new(config, storage, reporter)
        .context("Backup preconditions not met")?;
    tracing::debug!(
        target_dir = %orchestrator.run_info().target_dir(),
        "backup run prepared"
    );

    orchestrator.run().await.context("Backup run failed")
}
