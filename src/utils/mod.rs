use std::path::{Path, PathBuf};

use which::which;

use crate::errors::{BackupError, Result};

/// Resolves an external tool, either an explicit path or a name looked up on `PATH`.
///
/// The result must exist and be executable.
pub fn find_executable(explicit: Option<&Path>, name: &str) -> Result<PathBuf> {
    match explicit {
        Some(path) => {
            if is_executable(path) {
                Ok(path.to_path_buf())
            } else {
                Err(BackupError::Configuration(format!(
                    "{} is not an executable file",
                    path.display()
                )))
            }
        }
        None => which(name).map_err(|_| {
            BackupError::Configuration(format!(
                "{} executable not found in PATH. Please install it or configure its location.",
                name
            ))
        }),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
