//! Crash monitor and stability timer.

use super::{release, Inner};
use crate::platform::ExitWait;
use crate::restart::RestartDecision;
use crate::status::CorePhase;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Inner {
    /// Watch `id` until it exits, then classify the exit.
    pub(super) fn spawn_monitor(self: &Arc<Self>, id: u32, exit: ExitWait) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.monitor(id, exit).await;
        });
    }

    async fn monitor(self: Arc<Self>, id: u32, exit: ExitWait) {
        let outcome = exit.await;
        let mut state = self.state.lock().await;

        if state.tracked_id() != Some(id) {
            debug!(
                id,
                tracked = ?state.tracked_id(),
                %outcome,
                "exit of a process that is no longer tracked, ignoring"
            );
            return;
        }

        if state.stop_requested {
            info!(id, %outcome, "core exited after stop request");
            state.restart.reset();
            release(&mut state);
            self.publish(&state, CorePhase::Stopped);
            return;
        }

        if outcome.is_clean() {
            info!(id, "core exited cleanly");
            state.restart.reset();
            release(&mut state);
            self.publish(&state, CorePhase::Stopped);
            return;
        }

        warn!(id, %outcome, "core exited unexpectedly");
        release(&mut state);
        let budget = state.restart.max_attempts();
        match state.restart.record_crash() {
            RestartDecision::Exhausted => {
                self.publish(&state, CorePhase::Exhausted);
                drop(state);
                self.notifier.crash_exhausted(budget);
            }
            RestartDecision::Restart { attempt } => {
                info!(attempt, budget, "scheduling core restart");
                self.publish(&state, CorePhase::Restarting);
                drop(state);
                self.notifier.crash_restarting(attempt, budget);
                self.restart_after_backoff(attempt).await;
            }
        }
    }

    async fn restart_after_backoff(self: Arc<Self>, attempt: u32) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!(attempt, "supervisor shutting down, pending restart abandoned");
                return;
            }
            _ = tokio::time::sleep(self.settings.restart.backoff()) => {}
        }

        {
            let state = self.state.lock().await;
            // A stop resets the counter; a manual start sets the flag.
            if state.is_running() || state.restart.crash_count() != attempt {
                info!(
                    attempt,
                    running = state.is_running(),
                    crash_count = state.restart.crash_count(),
                    "core state changed during backoff, restart skipped"
                );
                return;
            }
        }

        info!(attempt, "restarting core");
        let outcome = Arc::clone(&self).start(true).await;

        let state = self.state.lock().await;
        if state.is_running() {
            let snapshot = state.restart.crash_count();
            drop(state);
            self.arm_stability_timer(snapshot);
        } else {
            warn!(attempt, ?outcome, "restart did not bring the core back");
            self.publish(&state, CorePhase::Crashed);
        }
    }

    /// After the stability window, reset the crash counter if the core is
    /// still up and nothing crashed since `snapshot` was taken.
    fn arm_stability_timer(self: &Arc<Self>, snapshot: u32) {
        let inner = Arc::clone(self);
        let window = self.settings.restart.stability_threshold();
        debug!(snapshot, ?window, "stability timer armed");
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(window) => inner.stability_elapsed(snapshot).await,
            }
        });
    }

    async fn stability_elapsed(&self, snapshot: u32) {
        let mut state = self.state.lock().await;
        let current = state.restart.crash_count();
        if state.is_running() && current == snapshot {
            info!(crash_count = current, "core stable, crash counter reset");
            state.restart.reset();
            self.publish(&state, CorePhase::Running);
        } else {
            debug!(
                snapshot,
                current,
                running = state.is_running(),
                "stability window passed without a reset"
            );
        }
    }
}
