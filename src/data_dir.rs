use std::path::{Path, PathBuf};

/// Manages the supervisor's data directory layout.
///
/// Everything the supervisor writes (core log, status snapshot, elevation
/// trampoline and pid breadcrumb) lives under a single root (default
/// `.core-supervisor/`).
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.core-supervisor/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the logs directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Log file receiving the core's stdout and stderr.
    pub fn core_log(&self) -> PathBuf {
        self.logs_dir().join("core.log")
    }

    /// Path to the status snapshot file.
    pub fn status(&self) -> PathBuf {
        self.root.join("core.status")
    }

    /// Pid breadcrumb of a privileged start (wrapper pid, then core pid).
    pub fn breadcrumb(&self) -> PathBuf {
        self.root.join("core.pids")
    }

    /// Trampoline script run under elevation.
    pub fn trampoline(&self) -> PathBuf {
        self.root.join("start-core.sh")
    }

    /// Create the root and logs directories.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(created)
    }
}

/// Replace `path` with `contents` through a temp file in the same directory,
/// so readers never see a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    std::fs::write(&tmp, contents)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
