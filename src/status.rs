//! `core.status`: a JSON snapshot rewritten on every supervisor transition.
//!
//! The tray UI and `core-supervisor --status` read it without talking to
//! the supervisor process.

use crate::data_dir::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorePhase {
    Starting,
    Running,
    /// Crashed, waiting out the backoff before the next attempt.
    Restarting,
    Stopping,
    Stopped,
    /// A restart attempt failed to bring the core back.
    Crashed,
    /// Crash budget used up; no more automatic restarts.
    Exhausted,
}

impl fmt::Display for CorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CorePhase::Starting => "starting",
            CorePhase::Running => "running",
            CorePhase::Restarting => "restarting",
            CorePhase::Stopping => "stopping",
            CorePhase::Stopped => "stopped",
            CorePhase::Crashed => "crashed",
            CorePhase::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub supervisor_pid: u32,
    pub phase: CorePhase,
    pub core_pid: Option<u32>,
    pub privileged: bool,
    pub crash_count: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

impl StatusData {
    /// Seconds the current core has been up, as of `last_update`.
    pub fn uptime_secs(&self) -> Option<i64> {
        self.started_at
            .map(|started| (self.last_update - started).num_seconds().max(0))
    }
}

pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json = serde_json::to_vec_pretty(data).map_err(StatusError::Json)?;
        write_atomic(&self.path, &json).map_err(|e| StatusError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// `Ok(None)` until the first write.
    pub fn read(&self) -> Result<Option<StatusData>, StatusError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(StatusError::Json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StatusError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

#[derive(Debug)]
pub enum StatusError {
    Json(serde_json::Error),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusError::Json(e) => write!(f, "malformed status data: {e}"),
            StatusError::Io { path, source } => {
                write!(f, "status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Json(e) => Some(e),
            StatusError::Io { source, .. } => Some(source),
        }
    }
}
