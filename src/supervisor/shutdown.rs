use super::{release, Inner, LaunchStrategy};
use crate::breadcrumb::{self, ElevatedPids};
use crate::status::CorePhase;
use crate::watchdog::ShutdownWatchdog;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a stop request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// No core was running.
    NotRunning,
    /// The core was asked to exit; a watchdog kills it if it lingers.
    Interrupted { pid: u32 },
    /// The interrupt could not be delivered, so the tree was killed.
    ForceKilled { pid: u32 },
    /// The elevated core was terminated through the elevator.
    ElevatedTerminated { pids: ElevatedPids },
}

impl Inner {
    pub(super) async fn stop(self: &Arc<Self>) -> StopOutcome {
        let mut state = self.state.lock().await;
        state.stop_requested = true;
        state.restart.reset();

        if !state.is_running() {
            state.stop_requested = false;
            if state.reconcile() {
                self.publish(&state, CorePhase::Stopped);
            }
            debug!("stop requested but the core is not running");
            return StopOutcome::NotRunning;
        }

        let Some(handle) = state.handle.clone() else {
            state.reconcile();
            state.stop_requested = false;
            self.publish(&state, CorePhase::Stopped);
            return StopOutcome::NotRunning;
        };
        self.publish(&state, CorePhase::Stopping);
        drop(state);

        match handle.strategy {
            LaunchStrategy::Elevated { pids, breadcrumb } => {
                self.stop_elevated(pids, &breadcrumb).await
            }
            LaunchStrategy::Direct { pid } => self.stop_direct(pid).await,
        }
    }

    async fn stop_elevated(&self, pids: ElevatedPids, crumb: &Path) -> StopOutcome {
        info!(
            wrapper = pids.wrapper,
            child = pids.child,
            "terminating elevated core"
        );
        match self.blocking(move |p| p.terminate_elevated(pids)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "elevated terminate failed"),
            Err(e) => warn!(error = %e, "elevated terminate task failed"),
        }
        breadcrumb::remove(crumb);

        let mut state = self.state.lock().await;
        match state.tracked_id() {
            Some(id) if id != pids.wrapper => {
                debug!(id, "a new core was started during stop, leaving it alone");
            }
            _ => {
                release(&mut state);
                self.publish(&state, CorePhase::Stopped);
            }
        }
        StopOutcome::ElevatedTerminated { pids }
    }

    async fn stop_direct(&self, pid: u32) -> StopOutcome {
        info!(pid, "interrupting core");
        let interrupted = self
            .blocking(move |p| p.interrupt(pid))
            .await
            .unwrap_or_else(|e| Err(std::io::Error::other(e)));

        match interrupted {
            Ok(()) => {
                let watchdog = ShutdownWatchdog::new(
                    Arc::clone(&self.platform),
                    self.settings.shutdown.graceful_timeout(),
                    self.settings.core.image_name(),
                );
                tokio::spawn(watchdog.watch(pid));
                StopOutcome::Interrupted { pid }
            }
            Err(e) => {
                warn!(pid, error = %e, "interrupt failed, killing core");
                let killed = self
                    .blocking(move |p| p.kill_tree(pid))
                    .await
                    .unwrap_or_else(|e| Err(std::io::Error::other(e)));
                if let Err(e) = killed {
                    error!(pid, error = %e, "failed to kill core");
                }
                StopOutcome::ForceKilled { pid }
            }
        }
    }
}
