/// Shutdown watchdog.
///
/// Armed after a graceful interrupt. When the grace period is over it looks
/// the pid up again and kills the process tree only if the pid is still
/// alive under the core's image name, so a recycled pid is left alone.
use crate::discovery;
use crate::platform::Platform;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The core was gone when the grace period ended.
    ExitedInTime,
    ForceKilled,
    KillFailed,
}

pub struct ShutdownWatchdog {
    platform: Arc<dyn Platform>,
    grace: Duration,
    image_name: String,
}

impl ShutdownWatchdog {
    pub fn new(platform: Arc<dyn Platform>, grace: Duration, image_name: String) -> Self {
        Self {
            platform,
            grace,
            image_name,
        }
    }

    pub async fn watch(self, pid: u32) -> WatchdogOutcome {
        tokio::time::sleep(self.grace).await;

        let platform = Arc::clone(&self.platform);
        let image = self.image_name.clone();
        let alive = tokio::task::spawn_blocking(move || {
            discovery::is_alive(platform.as_ref(), pid, &image)
        })
        .await
        .unwrap_or(false);
        if !alive {
            tracing::debug!(pid, "core exited within the grace period");
            return WatchdogOutcome::ExitedInTime;
        }

        tracing::warn!(
            pid,
            grace_secs = self.grace.as_secs(),
            "core still running after graceful shutdown, killing"
        );
        let platform = Arc::clone(&self.platform);
        match tokio::task::spawn_blocking(move || platform.kill_tree(pid)).await {
            Ok(Ok(())) => WatchdogOutcome::ForceKilled,
            Ok(Err(e)) => {
                tracing::error!(pid, error = %e, "failed to kill lingering core");
                WatchdogOutcome::KillFailed
            }
            Err(e) => {
                tracing::error!(pid, error = %e, "kill task failed");
                WatchdogOutcome::KillFailed
            }
        }
    }
}
