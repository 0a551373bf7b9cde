//! Per-task isolated directories and their merge back into the run directory.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use weft_core::config::MergePolicy;
use weft_core::error::{Result, WeftError};

/// Subdirectory of the run directory holding isolated task directories.
pub const ISOLATED_DIR: &str = ".isolated";

/// Outcome of merging one level's isolated directories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeSummary {
    pub merged: Vec<String>,
    pub discarded: Vec<String>,
    pub files: u64,
}

pub fn task_dir(run_dir: &Path, node_id: &str) -> PathBuf {
    run_dir.join(ISOLATED_DIR).join(node_id)
}

/// Create a fresh, empty isolated directory for `node_id`.
pub fn prepare_task_dir(run_dir: &Path, node_id: &str) -> Result<PathBuf> {
    let dir = task_dir(run_dir, node_id);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Recursively copy `src` into `dst`, skipping the isolated area.
/// Existing files in `dst` are overwritten. Returns the number of files.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut files = 0;
    let walker = walkdir::WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ISOLATED_DIR);
    for entry in walker {
        let entry = entry.map_err(|e| WeftError::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| WeftError::Validation(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}

/// Merge the isolated directories of a finished level into `run_dir`.
///
/// `outcomes` pairs each node id with whether it succeeded; merges happen
/// in that order. Every isolated directory is removed afterwards.
pub fn merge_level(
    run_dir: &Path,
    outcomes: &[(String, bool)],
    policy: MergePolicy,
) -> Result<MergeSummary> {
    let mut summary = MergeSummary::default();
    for (node_id, succeeded) in outcomes {
        let dir = task_dir(run_dir, node_id);
        if !dir.exists() {
            continue;
        }
        let keep = match policy {
            MergePolicy::RetainSuccessful => *succeeded,
            MergePolicy::RetainAll => true,
            MergePolicy::DiscardAll => false,
        };
        if keep {
            summary.files += copy_tree(&dir, run_dir)?;
            summary.merged.push(node_id.clone());
        } else {
            summary.discarded.push(node_id.clone());
        }
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!(node_id = %node_id, error = %e, "Failed to remove isolated directory");
        }
    }
    debug!(
        merged = summary.merged.len(),
        discarded = summary.discarded.len(),
        files = summary.files,
        "Level workspaces merged"
    );
    Ok(summary)
}
