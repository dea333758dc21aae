/// Launch planning and the two spawn paths: direct, or through the
/// elevation trampoline.
use crate::capabilities::CapabilityCheck;
use crate::config::{anchor, CoreConfig, PrivilegeMode};
use crate::elevation::{self, ElevationError, TrampolinePlan};
use crate::logfile;
use crate::platform::{Platform, SpawnRequest, SpawnedProcess};
use std::fs::File;
use std::path::{Path, PathBuf};

/// How the next start will launch the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    Direct,
    Elevated,
}

/// Decide the launch path for the current platform and core config.
///
/// A config that needs a TUN interface is started elevated in `Elevate`
/// mode, and requires binary capabilities in `Capabilities` mode.
pub fn plan_launch(
    mode: PrivilegeMode,
    needs_tun: bool,
    executable: &Path,
    capabilities: &dyn CapabilityCheck,
) -> Result<LaunchKind, StartError> {
    if !needs_tun {
        return Ok(LaunchKind::Direct);
    }
    match mode.resolve() {
        PrivilegeMode::Elevate => Ok(LaunchKind::Elevated),
        PrivilegeMode::Capabilities => {
            capabilities
                .check(executable)
                .map_err(|suggestion| StartError::Capability { suggestion })?;
            Ok(LaunchKind::Direct)
        }
        PrivilegeMode::None | PrivilegeMode::Auto => Ok(LaunchKind::Direct),
    }
}

/// Spawn request for `core` with its paths anchored at `base`.
pub fn direct_request(core: &CoreConfig, base: &Path, log: Option<File>) -> SpawnRequest {
    let core = core.anchored(base);
    SpawnRequest {
        args: core.build_args(),
        working_dir: core.resolved_working_dir(),
        program: core.executable,
        log,
    }
}

/// Trampoline inputs for `core`, with every path anchored at `base`.
pub fn trampoline_plan(core: &CoreConfig, base: &Path, log_path: &Path) -> TrampolinePlan {
    let core = core.anchored(base);
    TrampolinePlan {
        args: core.build_args(),
        working_dir: core.resolved_working_dir(),
        program: core.executable,
        log: anchor(base, log_path),
    }
}

/// Rotate and open the core log, then spawn the core unprivileged.
///
/// If the log cannot be opened the core still starts, with its output
/// discarded.
pub fn spawn_direct(
    platform: &dyn Platform,
    core: &CoreConfig,
    log_path: &Path,
    max_log_bytes: u64,
) -> Result<SpawnedProcess, StartError> {
    let base = std::env::current_dir().map_err(|e| StartError::Spawn {
        program: core.executable.clone(),
        source: e,
    })?;
    let log = match logfile::open_with_rotation(log_path, max_log_bytes) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %log_path.display(),
                "core log unavailable, output will not be logged"
            );
            None
        }
    };

    let request = direct_request(core, &base, log);
    tracing::info!(
        program = %request.program.display(),
        args = ?request.args,
        working_dir = %request.working_dir.display(),
        "spawning core"
    );

    let program = request.program.clone();
    platform
        .spawn(request)
        .map_err(|e| StartError::Spawn { program, source: e })
}

/// Rotate the core log and write the trampoline script for an elevated start.
pub fn prepare_trampoline(
    core: &CoreConfig,
    log_path: &Path,
    max_log_bytes: u64,
    script_path: &Path,
) -> Result<(), StartError> {
    let script_error = |e| StartError::Script {
        path: script_path.to_path_buf(),
        source: e,
    };
    let base = std::env::current_dir().map_err(script_error)?;
    logfile::rotate_if_needed(log_path, max_log_bytes);
    let plan = trampoline_plan(core, &base, log_path);
    elevation::write_trampoline(script_path, &plan).map_err(script_error)
}

/// Why a start did not produce a running core.
#[derive(Debug)]
pub enum StartError {
    /// The core binary could not be spawned (missing, not executable, ...).
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    /// The binary lacks the OS capabilities the config needs.
    Capability { suggestion: String },
    /// The user declined elevation or the elevator failed.
    ElevationDenied { source: ElevationError },
    /// The trampoline script could not be written.
    Script {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Spawn { program, source } => {
                write!(
                    f,
                    "failed to start core process {}: {source}",
                    program.display()
                )
            }
            StartError::Capability { suggestion } => {
                write!(f, "missing capabilities: {suggestion}")
            }
            StartError::ElevationDenied { source } => {
                write!(f, "privileged start failed: {source}")
            }
            StartError::Script { path, source } => {
                write!(
                    f,
                    "failed to write trampoline script {}: {source}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::Spawn { source, .. } => Some(source),
            StartError::Capability { .. } => None,
            StartError::ElevationDenied { source } => Some(source),
            StartError::Script { source, .. } => Some(source),
        }
    }
}
