use crate::breadcrumb::ElevatedPids;
use crate::restart::RestartPolicy;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How the current core process was launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStrategy {
    Direct { pid: u32 },
    Elevated { pids: ElevatedPids, breadcrumb: PathBuf },
}

/// Bookkeeping for the one core process the supervisor manages.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub strategy: LaunchStrategy,
    pub executable: PathBuf,
    pub config: PathBuf,
    pub log: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl ProcessHandle {
    /// Identity of the monitored process: the core's pid, or the
    /// wrapper's pid for an elevated start.
    pub fn id(&self) -> u32 {
        match &self.strategy {
            LaunchStrategy::Direct { pid } => *pid,
            LaunchStrategy::Elevated { pids, .. } => pids.wrapper,
        }
    }

    /// Pid of the core itself.
    pub fn core_pid(&self) -> u32 {
        match &self.strategy {
            LaunchStrategy::Direct { pid } => *pid,
            LaunchStrategy::Elevated { pids, .. } => pids.child,
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self.strategy, LaunchStrategy::Elevated { .. })
    }
}

/// Whether the core is believed alive.
///
/// Readable from anywhere without the supervisor lock. Writes go through
/// [`CoreState::set_running`], so they only happen with the lock held.
#[derive(Debug, Clone, Default)]
pub struct RunningState(Arc<AtomicBool>);

impl RunningState {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, running: bool) {
        self.0.store(running, Ordering::SeqCst);
    }
}

/// Everything guarded by the supervisor lock.
#[derive(Debug)]
pub(crate) struct CoreState {
    pub handle: Option<ProcessHandle>,
    pub stop_requested: bool,
    pub restart: RestartPolicy,
    running: RunningState,
}

impl CoreState {
    pub fn new(running: RunningState, max_attempts: u32) -> Self {
        Self {
            handle: None,
            stop_requested: false,
            restart: RestartPolicy::new(max_attempts),
            running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn set_running(&mut self, running: bool) {
        self.running.set(running);
    }

    /// Identity of the tracked process, if any.
    pub fn tracked_id(&self) -> Option<u32> {
        self.handle.as_ref().map(ProcessHandle::id)
    }

    /// Install a freshly started process.
    pub fn begin(&mut self, handle: ProcessHandle) {
        self.handle = Some(handle);
        self.stop_requested = false;
        self.set_running(true);
    }

    /// The tracked process is gone: clear the handle and the running flag.
    /// Returns the old handle.
    pub fn finish(&mut self) -> Option<ProcessHandle> {
        self.set_running(false);
        self.stop_requested = false;
        self.handle.take()
    }

    /// Fix up a handle and running flag that disagree. Returns true if
    /// anything had to change.
    pub fn reconcile(&mut self) -> bool {
        match (self.handle.is_some(), self.is_running()) {
            (true, false) => {
                tracing::warn!(
                    tracked = ?self.tracked_id(),
                    "stale process handle without a running core, clearing"
                );
                self.handle = None;
                true
            }
            (false, true) => {
                tracing::warn!("running flag set without a process handle, clearing");
                self.set_running(false);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            running: self.is_running(),
            pid: self.handle.as_ref().map(ProcessHandle::core_pid),
            privileged: self.handle.as_ref().is_some_and(ProcessHandle::is_elevated),
            crash_count: self.restart.crash_count(),
            max_attempts: self.restart.max_attempts(),
            started_at: self.handle.as_ref().map(|h| h.started_at),
        }
    }
}

/// Point-in-time view of the supervisor, for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    pub running: bool,
    pub pid: Option<u32>,
    pub privileged: bool,
    pub crash_count: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl SupervisorSnapshot {
    /// One-line summary for a tray tooltip or the CLI.
    pub fn status_line(&self) -> String {
        if !self.running {
            return "Stopped".to_string();
        }
        let mut line = match self.pid {
            Some(pid) => format!("Running (pid {pid})"),
            None => "Running".to_string(),
        };
        if self.privileged {
            line.push_str(", elevated");
        }
        if self.crash_count > 0 {
            line.push_str(&format!(
                ", restarts {}/{}",
                self.crash_count, self.max_attempts
            ));
        }
        line
    }
}
