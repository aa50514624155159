// projectbackup/src/backup/archive.rs
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::errors::{BackupError, Result};
use crate::reporter::Reporter;
use crate::utils::find_executable;

const STAGE: &str = "archive";

/// zip refuses split sizes below 64k.
const MIN_PARTS_SIZE: u64 = 64 * 1024;

/// Split size as understood by `zip -s`.
///
/// The configured string is what gets passed to the tool; the byte value is
/// only used for validation and for checking the produced parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartsSize {
    raw: String,
    bytes: u64,
}

impl PartsSize {
    /// Parses `"750m"`, `"2g"`, `"512k"`, `"1t"` (1024-based). A bare number
    /// is megabytes, the same default zip applies.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let invalid = || BackupError::Configuration(format!("Invalid parts size '{}'", raw));

        let (digits, multiplier) = match trimmed.chars().last() {
            Some(unit) if unit.is_ascii_alphabetic() => {
                let multiplier: u64 = match unit.to_ascii_lowercase() {
                    'k' => 1024,
                    'm' => 1024 * 1024,
                    'g' => 1024 * 1024 * 1024,
                    't' => 1024 * 1024 * 1024 * 1024,
                    _ => return Err(invalid()),
                };
                (&trimmed[..trimmed.len() - unit.len_utf8()], multiplier)
            }
            Some(_) => (trimmed, 1024 * 1024),
            None => return Err(invalid()),
        };

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        let bytes = value.checked_mul(multiplier).ok_or_else(invalid)?;
        if bytes < MIN_PARTS_SIZE {
            return Err(BackupError::Configuration(format!(
                "Parts size '{}' is below the 64k minimum",
                raw
            )));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// One physical file of a (possibly split) archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePart {
    pub path: PathBuf,
    pub size: u64,
}

impl ArchivePart {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Drives the external `zip` tool.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    zip_path: PathBuf,
}

impl ArchiveBuilder {
    /// Locates the zip executable, failing fast with a configuration error.
    pub fn new(explicit_zip: Option<&Path>) -> Result<Self> {
        let zip_path = find_executable(explicit_zip, "zip")?;
        Ok(Self { zip_path })
    }

    /// Zips everything under `base_path` except `exclusions` into
    /// `output_path`, split into parts of at most `parts_size`.
    ///
    /// The tool runs with `base_path` as its working directory; the
    /// process-wide current directory is never touched.
    pub async fn build(
        &self,
        base_path: &Path,
        exclusions: &[String],
        parts_size: &PartsSize,
        output_path: &Path,
        reporter: &dyn Reporter,
    ) -> Result<Vec<ArchivePart>> {
        reporter.info(
            STAGE,
            &format!(
                "Creating archive {} from {} ({} exclusions, parts of {})",
                output_path.display(),
                base_path.display(),
                exclusions.len(),
                parts_size.as_str()
            ),
        );

        let mut command = Command::new(&self.zip_path);
        command
            .current_dir(base_path)
            .arg("-qrs")
            .arg(parts_size.as_str())
            .arg(output_path)
            .arg(".")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !exclusions.is_empty() {
            command.arg("-x").args(exclusions);
        }

        let output = command.output().await.map_err(|e| {
            reporter.error(
                STAGE,
                &format!("Could not start {}: {}", self.zip_path.display(), e),
            );
            BackupError::ArchiveCommandFailed {
                status: None,
                stderr: e.to_string(),
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || !stdout.trim().is_empty() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if !stdout.trim().is_empty() {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(stdout.trim());
            }
            reporter.error(STAGE, &format!("zip failed with {}: {}", output.status, stderr));
            return Err(BackupError::ArchiveCommandFailed {
                status: Some(output.status),
                stderr,
            });
        }

        let parts = collect_parts(output_path)?;
        for part in &parts {
            if part.size > parts_size.bytes() {
                reporter.warn(
                    STAGE,
                    &format!(
                        "Part {} is {} bytes, larger than the configured {}",
                        part.file_name(),
                        part.size,
                        parts_size.as_str()
                    ),
                );
            }
        }
        reporter.info(STAGE, &format!("✓ Archive created in {} part(s)", parts.len()));
        Ok(parts)
    }
}

/// Finds `<stem>.zip` plus its split siblings `<stem>.z01`, `<stem>.z02`, ...
/// next to `output_path`, sorted by name.
fn collect_parts(output_path: &Path) -> Result<Vec<ArchivePart>> {
    let directory = output_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut parts = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        let is_part = path.file_stem().map(|s| s.to_string_lossy() == stem.as_str()) == Some(true)
            && path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .is_some_and(|e| e == "zip" || is_split_extension(&e));
        if is_part && entry.file_type()?.is_file() {
            parts.push(ArchivePart {
                size: entry.metadata()?.len(),
                path,
            });
        }
    }
    parts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(parts)
}

fn is_split_extension(extension: &str) -> bool {
    extension.len() >= 3
        && extension.starts_with('z')
        && extension[1..].chars().all(|c| c.is_ascii_digit())
}

/// Entry names stored in `archive`, or `None` when `unzip` is not installed.
#[cfg(test)]
pub(crate) fn list_entries(archive: &Path) -> anyhow::Result<Option<Vec<String>>> {
    let Ok(unzip) = which::which("unzip") else {
        return Ok(None);
    };
    let output = std::process::Command::new(unzip).arg("-Z1").arg(archive).output()?;
    anyhow::ensure!(
        output.status.success(),
        "unzip failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(Some(
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect(),
    ))
}
