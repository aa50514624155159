// projectbackup/src/backup/exclusions.rs
//! Paths left out of the project archive.
//!
//! Patterns are relative to the project root in the `./<dir>/*` form the
//! zip tool expects when it is run from that root.

use std::path::{Component, Path, PathBuf};

/// Builds the ordered exclusion list: workspace first, then the local
/// destination root (if any), then the configured directories in order.
///
/// `workspace` may be a single run workspace or the directory holding all
/// of them.
pub fn compute_exclusions(
    base_path: &Path,
    workspace: &Path,
    local_destination_root: Option<&Path>,
    configured: &[String],
) -> Vec<String> {
    let mut patterns = Vec::with_capacity(configured.len() + 2);

    patterns.push(pattern_for(&relative_path(base_path, workspace)));

    if let Some(root) = local_destination_root {
        patterns.push(pattern_for(&relative_path(base_path, root)));
    }

    for directory in configured {
        let cleaned = directory.trim().trim_start_matches("./");
        let cleaned = cleaned.trim_end_matches(['/', '*']);
        if cleaned.is_empty() {
            continue;
        }
        patterns.push(pattern_for(Path::new(cleaned)));
    }

    patterns
}

fn pattern_for(relative: &Path) -> String {
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        "./*".to_string()
    } else {
        format!("./{}/*", joined)
    }
}

/// `target` expressed relative to `base`, climbing with `..` when `target`
/// lives outside of `base`. Both paths are expected to be absolute.
pub fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component<'_>> = base.components().collect();
    let target: Vec<Component<'_>> = target.components().collect();

    let common = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in target.iter().skip(common) {
        relative.push(component.as_os_str());
    }
    relative
}
