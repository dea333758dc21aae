//! OS capability interface: spawn, elevated spawn, signal, kill, list.
//!
//! The supervisor's state machine only talks to [`Platform`]; the native
//! implementation is picked once at startup by [`native`].

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixPlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform;

use crate::breadcrumb::ElevatedPids;
use crate::elevation::ElevationError;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// A running OS process as seen by a process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
}

/// How a managed process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit status zero.
    Clean,
    /// Non-zero exit, death by signal, or a failed wait.
    Failed { code: Option<i32>, detail: String },
}

impl ExitOutcome {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if status.success() {
            ExitOutcome::Clean
        } else {
            ExitOutcome::Failed {
                code: status.code(),
                detail: status.to_string(),
            }
        }
    }

    pub fn from_wait(result: std::io::Result<std::process::ExitStatus>) -> Self {
        match result {
            Ok(status) => Self::from_status(status),
            Err(e) => ExitOutcome::Failed {
                code: None,
                detail: format!("wait failed: {e}"),
            },
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ExitOutcome::Clean)
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Clean => write!(f, "exit status: 0"),
            ExitOutcome::Failed { detail, .. } => write!(f, "{detail}"),
        }
    }
}

/// Resolves once the process has exited. Never times out.
pub type ExitWait = Pin<Box<dyn Future<Output = ExitOutcome> + Send + 'static>>;

/// Everything needed to spawn the core unprivileged.
#[derive(Debug)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Sink for both stdout and stderr; `None` discards output.
    pub log: Option<File>,
}

/// A freshly spawned process and its exit future.
pub struct SpawnedProcess {
    pub pid: u32,
    pub exit: ExitWait,
}

/// A process started through the elevation trampoline.
///
/// `exit` resolves when the wrapper exits, which the trampoline makes
/// coincide with the core's own exit.
pub struct ElevatedProcess {
    pub pids: ElevatedPids,
    pub exit: ExitWait,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess").field("pid", &self.pid).finish()
    }
}

impl std::fmt::Debug for ElevatedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevatedProcess")
            .field("pids", &self.pids)
            .finish()
    }
}

/// Per-platform process operations used by the supervisor.
pub trait Platform: Send + Sync {
    /// Human-readable platform name, for logs.
    fn name(&self) -> &str;

    /// Spawn the core with both output streams bound to the request's log sink.
    /// Must be called from within a tokio runtime.
    fn spawn(&self, request: SpawnRequest) -> std::io::Result<SpawnedProcess>;

    /// Run `script` with elevated rights. Blocks until the script has reported
    /// its own pid and the core's pid (or until elevation fails).
    fn spawn_elevated(&self, script: &Path) -> Result<ElevatedProcess, ElevationError>;

    /// Ask the process to shut down gracefully.
    fn interrupt(&self, pid: u32) -> std::io::Result<()>;

    /// Forcibly kill the process and its descendants.
    fn kill_tree(&self, pid: u32) -> std::io::Result<()>;

    /// Terminate elevated processes through the elevation mechanism. Blocking.
    fn terminate_elevated(&self, pids: ElevatedPids) -> Result<(), ElevationError>;

    /// Delete a network interface left behind by an earlier core, so a new
    /// TUN inbound with the same name can be created. Blocking. Returns
    /// whether an interface was removed; a no-op where the OS cleans up
    /// after the process.
    fn remove_tun_interface(&self, _name: &str) -> std::io::Result<bool> {
        Ok(false)
    }

    /// Primary process listing.
    fn list_processes(&self) -> std::io::Result<Vec<ProcessInfo>>;

    /// Secondary listing, used when the primary one fails.
    fn list_processes_fallback(&self) -> std::io::Result<Vec<ProcessInfo>> {
        Ok(snapshot_processes())
    }
}

/// Process listing from a `sysinfo` snapshot. Cannot fail.
pub fn snapshot_processes() -> Vec<ProcessInfo> {
    use sysinfo::{ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessInfo {
            pid: pid.as_u32(),
            parent: process.parent().map(|p| p.as_u32()),
            name: process.name().to_string_lossy().to_string(),
        })
        .collect()
}

/// The platform implementation for the host OS.
#[cfg(unix)]
pub fn native(elevator: Vec<String>) -> Arc<dyn Platform> {
    Arc::new(UnixPlatform::new(elevator))
}

/// The platform implementation for the host OS.
#[cfg(windows)]
pub fn native(_elevator: Vec<String>) -> Arc<dyn Platform> {
    Arc::new(WindowsPlatform::new())
}
