// projectbackup/src/backup/retention.rs
use crate::errors::Result;
use crate::reporter::Reporter;
use crate::storage::Storage;

const STAGE: &str = "retention";

/// Deletes the oldest backup directory under `base_name` when the existing
/// ones, together with the backup this run is about to write, would exceed
/// `keep`.
///
/// At most one directory is removed per call; one call per run keeps the
/// destination converging on `keep` backups. Directory names carry a
/// fixed-width timestamp, so lexical order is chronological order.
///
/// A listing failure counts as "no backups yet".
pub async fn prune(
    storage: &dyn Storage,
    base_name: &str,
    keep: usize,
    reporter: &dyn Reporter,
) -> Result<Option<String>> {
    let mut directories = match storage.list_directories(base_name).await {
        Ok(directories) => directories,
        Err(e) => {
            reporter.warn(
                STAGE,
                &format!("Could not list {}, assuming no previous backups: {}", base_name, e),
            );
            return Ok(None);
        }
    };

    directories.sort_by(|a, b| b.cmp(a));

    if directories.len() < keep {
        reporter.info(
            STAGE,
            &format!("{} backup(s) present, keeping up to {}", directories.len(), keep),
        );
        return Ok(None);
    }

    let Some(obsolete) = directories.pop() else {
        return Ok(None);
    };
    storage.delete_directory(&obsolete).await?;
    reporter.info(STAGE, &format!("Deleted obsolete backup {}", obsolete));
    Ok(Some(obsolete))
}
