/// Pid breadcrumb for privileged starts.
///
/// Two newline-separated integers: the elevation wrapper's pid, then the
/// core's pid. Written atomically (temp file + rename) at privileged start,
/// removed at stop. Best-effort bookkeeping only.
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElevatedPids {
    pub wrapper: u32,
    pub child: u32,
}

/// Render the breadcrumb contents.
pub fn format(pids: ElevatedPids) -> String {
    format!("{}\n{}\n", pids.wrapper, pids.child)
}

/// Parse breadcrumb contents; both lines must hold positive integers.
pub fn parse(contents: &str) -> Option<ElevatedPids> {
    let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());
    let wrapper: u32 = lines.next()?.parse().ok()?;
    let child: u32 = lines.next()?.parse().ok()?;
    if wrapper == 0 || child == 0 {
        return None;
    }
    Some(ElevatedPids { wrapper, child })
}

/// Atomically write the breadcrumb.
pub fn write(path: &Path, pids: ElevatedPids) -> Result<(), BreadcrumbError> {
    crate::data_dir::write_atomic(path, format(pids).as_bytes()).map_err(|e| {
        BreadcrumbError::Write {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Read the breadcrumb. `Ok(None)` when there is none.
pub fn read(path: &Path) -> Result<Option<ElevatedPids>, BreadcrumbError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(BreadcrumbError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    parse(&contents)
        .map(Some)
        .ok_or_else(|| BreadcrumbError::Malformed {
            path: path.to_path_buf(),
        })
}

/// Remove the breadcrumb, ignoring a missing file.
pub fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, path = %path.display(), "failed to remove pid breadcrumb");
        }
    }
}

#[derive(Debug)]
pub enum BreadcrumbError {
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Malformed {
        path: PathBuf,
    },
}

impl std::fmt::Display for BreadcrumbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreadcrumbError::Write { path, source } => {
                write!(f, "failed to write pid breadcrumb {}: {source}", path.display())
            }
            BreadcrumbError::Read { path, source } => {
                write!(f, "failed to read pid breadcrumb {}: {source}", path.display())
            }
            BreadcrumbError::Malformed { path } => {
                write!(f, "malformed pid breadcrumb {}", path.display())
            }
        }
    }
}

impl std::error::Error for BreadcrumbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreadcrumbError::Write { source, .. } => Some(source),
            BreadcrumbError::Read { source, .. } => Some(source),
            BreadcrumbError::Malformed { .. } => None,
        }
    }
}
