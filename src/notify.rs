/// Presentation boundary: everything the user should see goes through a
/// [`Notifier`]. The tray app implements it with dialogs; the CLI logs.
use crate::launcher::StartError;
use crate::supervisor::SupervisorSnapshot;

pub trait Notifier: Send + Sync {
    /// Informational message (e.g. "already running").
    fn info(&self, message: &str);

    /// A start failed; not retried automatically.
    fn startup_error(&self, error: &StartError);

    /// A core not launched by this supervisor is running. The host should
    /// ask whether to kill it (see `Supervisor::kill_foreign`).
    fn already_running(&self, pid: u32);

    /// The core crashed and will be restarted.
    fn crash_restarting(&self, attempt: u32, budget: u32);

    /// The core crashed more than `budget` times in a row; giving up.
    fn crash_exhausted(&self, budget: u32);

    /// The status indicator should be refreshed.
    fn status_changed(&self, _snapshot: &SupervisorSnapshot) {}

    /// The core has been up for a moment; reload the proxy list.
    fn refresh_proxies(&self) {}
}

/// Notifier that only writes to the log.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn startup_error(&self, error: &StartError) {
        tracing::error!(error = %error, "core failed to start");
    }

    fn already_running(&self, pid: u32) {
        tracing::warn!(pid, "core is already running outside this supervisor");
    }

    fn crash_restarting(&self, attempt: u32, budget: u32) {
        tracing::warn!(attempt, budget, "core crashed, restarting");
    }

    fn crash_exhausted(&self, budget: u32) {
        tracing::error!(
            budget,
            "core failed to restart after {budget} attempts, check the core log"
        );
    }

    fn status_changed(&self, snapshot: &SupervisorSnapshot) {
        tracing::debug!(
            running = snapshot.running,
            pid = ?snapshot.pid,
            crash_count = snapshot.crash_count,
            "status changed"
        );
    }
}
