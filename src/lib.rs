//! Supervisor for a single long-running proxy-core process.
//!
//! Finds an already-running core, launches one (directly or through an
//! elevation trampoline), restarts it after crashes within a retry budget,
//! and stops it gracefully with a force-kill fallback.

pub mod breadcrumb;
pub mod capabilities;
pub mod config;
pub mod data_dir;
pub mod discovery;
pub mod elevation;
pub mod inspect;
pub mod launcher;
pub mod logfile;
pub mod notify;
pub mod platform;
pub mod restart;
pub mod signals;
pub mod status;
pub mod supervisor;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use config::SupervisorConfig;
pub use supervisor::{StartOutcome, StopOutcome, Supervisor, SupervisorSnapshot};
