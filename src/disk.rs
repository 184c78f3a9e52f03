//! Free space measurement and oldest-first purging of managed folders.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use sysinfo::Disks;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Free space in GB on the disk holding `path`.
///
/// The disk with the longest mount point prefix of `path` wins, so a
/// separately mounted data partition is measured rather than the root
/// filesystem.
pub fn free_space_gb(path: &Path) -> Result<f64> {
    let path = path
        .canonicalize()
        .with_context(|| format!("cannot canonicalize {:?}", path))?;
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .with_context(|| format!("no disk found for {:?}", path))?;
    Ok(disk.available_space() as f64 / BYTES_PER_GB)
}

/// All files under `root`, oldest modification time first. Subdirectories
/// left empty by earlier purging are removed along the way; `root` itself is
/// never removed.
pub fn scan_folder(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if entry.file_type().is_dir() {
            if path != root && path.read_dir().map(|mut d| d.next().is_none()).unwrap_or(false) {
                if let Err(e) = std::fs::remove_dir(path) {
                    debug!("Could not remove empty folder {:?}: {}", path, e);
                }
            }
            continue;
        }
        let mtime = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((mtime, path.to_path_buf()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files.into_iter().map(|(_, p)| p).collect()
}

/// Delete files from `folders`, oldest first across all of them, until the
/// measured free space reaches `min_free_space` GB.
///
/// `measure` is called after every deletion so the decision tracks the real
/// filesystem. Returns `Ok(true)` when the target was reached, `Ok(false)`
/// when every candidate file is gone and space is still short.
pub fn purge(
    folders: &[PathBuf],
    free_space: f64,
    min_free_space: f64,
    measure: &mut dyn FnMut() -> Result<f64>,
) -> Result<bool> {
    if free_space >= min_free_space {
        return Ok(true);
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    for folder in folders {
        if folder.exists() {
            candidates.extend(scan_folder(folder));
        }
    }
    candidates.sort_by_key(|p| {
        std::fs::metadata(p)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    });

    let mut current = free_space;
    for path in candidates {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Could not purge {:?}: {}", path, e);
            continue;
        }
        debug!("Purged {:?}", path);
        current = measure()?;
        if current >= min_free_space {
            info!(
                "Purging reached target, {:.2} GB free (minimum {:.2} GB)",
                current, min_free_space
            );
            return Ok(true);
        }
    }

    warn!(
        "Purging exhausted {} folder(s), {:.2} GB free is still below {:.2} GB",
        folders.len(),
        current,
        min_free_space
    );
    Ok(false)
}
