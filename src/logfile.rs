//! Core log sink: size-based rotation and append-mode opening.
//!
//! Rotation only ever happens right before a new start, so the running core
//! never has its file renamed underneath it.

use std::fs::File;
use std::path::{Path, PathBuf};

/// Path of the single rotated backup (`core.log` -> `core.log.old`).
pub fn rotated_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

/// Rename the log to `.old` if it is larger than `max_bytes`.
///
/// Returns `true` if a rotation happened. A missing log is not an error.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64) -> bool {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return false,
    };
    if size <= max_bytes {
        return false;
    }

    let old = rotated_path(log_path);
    let _ = std::fs::remove_file(&old);
    match std::fs::rename(log_path, &old) {
        Ok(()) => {
            tracing::info!(path = %log_path.display(), size, "rotated core log");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %log_path.display(), "failed to rotate core log");
            false
        }
    }
}

/// Rotate if needed, then open the log for appending.
pub fn open_with_rotation(log_path: &Path, max_bytes: u64) -> std::io::Result<File> {
    rotate_if_needed(log_path, max_bytes);
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
}
