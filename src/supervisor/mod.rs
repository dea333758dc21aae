//! The supervisor: owns the one core process and its lifecycle.
//!
//! All mutable state sits behind a single async lock. The running flag is
//! mirrored in a [`RunningState`] so a UI can read it without waiting on
//! that lock. Every spawned process gets a monitor task that compares its
//! own pid with the tracked one before acting, so exits of replaced
//! processes are ignored.

mod monitor;
mod shutdown;
mod state;

pub use shutdown::StopOutcome;
pub use state::{LaunchStrategy, ProcessHandle, RunningState, SupervisorSnapshot};

use crate::breadcrumb;
use crate::capabilities::{CapabilityCheck, GetcapCheck, NoCapabilityCheck};
use crate::config::{anchor, SupervisorConfig};
use crate::data_dir::DataDir;
use crate::discovery::{self, RunningInstance};
use crate::elevation::ElevationError;
use crate::inspect::{ConfigInspector, TunInspector};
use crate::launcher::{self, LaunchKind, StartError};
use crate::notify::{Notifier, TracingNotifier};
use crate::platform::{self, Platform};
use crate::status::{CorePhase, StatusData, StatusFile};
use chrono::Utc;
use state::CoreState;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a start request.
#[derive(Debug)]
pub enum StartOutcome {
    /// A new core is running with this pid.
    Started { pid: u32 },
    /// The supervisor already runs a core; nothing was spawned.
    AlreadyRunning,
    /// A core this supervisor did not launch is alive.
    ForeignInstance { pid: u32 },
    /// The start failed; the notifier has been told.
    Failed(StartError),
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }
}

type StartFuture = Pin<Box<dyn Future<Output = StartOutcome> + Send + 'static>>;

/// Handle to the supervisor. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SupervisorConfig,
    data_dir: DataDir,
    platform: Arc<dyn Platform>,
    notifier: Arc<dyn Notifier>,
    inspector: Box<dyn ConfigInspector>,
    capabilities: Box<dyn CapabilityCheck>,
    status_file: StatusFile,
    state: Mutex<CoreState>,
    running: RunningState,
    cancel: CancellationToken,
}

pub struct SupervisorBuilder {
    config: SupervisorConfig,
    platform: Option<Arc<dyn Platform>>,
    notifier: Option<Arc<dyn Notifier>>,
    inspector: Option<Box<dyn ConfigInspector>>,
    capabilities: Option<Box<dyn CapabilityCheck>>,
    cancel: Option<CancellationToken>,
}

impl SupervisorBuilder {
    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn inspector(mut self, inspector: Box<dyn ConfigInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn capabilities(mut self, capabilities: Box<dyn CapabilityCheck>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Token that ends pending restarts and timers when cancelled.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(mut self) -> Supervisor {
        match std::env::current_dir() {
            Ok(cwd) => {
                self.config.core = self.config.core.anchored(&cwd);
                self.config.storage.data_dir = anchor(&cwd, &self.config.storage.data_dir);
            }
            Err(e) => warn!(error = %e, "current directory unknown, paths left relative"),
        }
        let data_dir = DataDir::new(&self.config.storage.data_dir);
        if let Err(e) = data_dir.init() {
            warn!(
                error = %e,
                path = %data_dir.root().display(),
                "failed to create data directory"
            );
        }

        let platform = self
            .platform
            .unwrap_or_else(|| platform::native(self.config.privileged.elevator.clone()));
        let capabilities: Box<dyn CapabilityCheck> = match self.capabilities {
            Some(check) => check,
            None if cfg!(target_os = "linux") => Box::new(GetcapCheck),
            None => Box::new(NoCapabilityCheck),
        };
        let running = RunningState::default();
        let state = CoreState::new(running.clone(), self.config.restart.max_attempts);

        Supervisor {
            inner: Arc::new(Inner {
                status_file: StatusFile::new(data_dir.status()),
                data_dir,
                platform,
                notifier: self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
                inspector: self.inspector.unwrap_or_else(|| Box::new(TunInspector)),
                capabilities,
                state: Mutex::new(state),
                running,
                cancel: self.cancel.unwrap_or_else(CancellationToken::new),
                settings: self.config,
            }),
        }
    }
}

impl Supervisor {
    pub fn builder(config: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            platform: None,
            notifier: None,
            inspector: None,
            capabilities: None,
            cancel: None,
        }
    }

    /// Supervisor with the native platform and log-only notifications.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::builder(config).build()
    }

    /// Start the core unless it is already running.
    pub async fn start(&self) -> StartOutcome {
        Arc::clone(&self.inner).start(false).await
    }

    /// Stop the core. Does nothing if it is not running.
    pub async fn stop(&self) -> StopOutcome {
        self.inner.stop().await
    }

    /// Cancel pending restarts and timers, then stop the core.
    pub async fn shutdown(&self) -> StopOutcome {
        info!("supervisor shutting down");
        self.inner.cancel.cancel();
        self.inner.stop().await
    }

    /// Lock-free check of the running flag.
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Shared running flag, for UIs that poll it.
    pub fn running_state(&self) -> RunningState {
        self.inner.running.clone()
    }

    pub async fn status(&self) -> SupervisorSnapshot {
        self.inner.state.lock().await.snapshot()
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.inner.data_dir
    }

    /// Look for a core left over from an earlier session. A foreign
    /// instance is reported to the notifier.
    pub async fn check_running_at_startup(&self) -> Option<RunningInstance> {
        if let Ok(Some(pids)) = breadcrumb::read(&self.inner.data_dir.breadcrumb()) {
            info!(
                wrapper = pids.wrapper,
                child = pids.child,
                "found breadcrumb of an earlier elevated start"
            );
        }
        let tracked = self.inner.state.lock().await.tracked_id();
        let found = self.inner.discover(tracked).await?;
        if !found.ours {
            self.inner.notifier.already_running(found.pid);
        }
        Some(found)
    }

    /// Kill a core process this supervisor did not launch.
    pub async fn kill_foreign(&self, pid: u32) -> std::io::Result<()> {
        let tracked = self
            .inner
            .state
            .lock()
            .await
            .handle
            .as_ref()
            .map(ProcessHandle::core_pid);
        if tracked == Some(pid) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("pid {pid} is managed by this supervisor, stop it instead"),
            ));
        }
        info!(pid, "killing foreign core process");
        self.inner
            .blocking(move |p| p.kill_tree(pid))
            .await
            .unwrap_or_else(|e| Err(std::io::Error::other(e)))
    }
}

impl Inner {
    fn start(self: Arc<Self>, skip_check: bool) -> StartFuture {
        Box::pin(async move { self.start_inner(skip_check).await })
    }

    async fn start_inner(self: Arc<Self>, skip_check: bool) -> StartOutcome {
        if self.running.get() {
            self.notifier.info("The core is already running.");
            return StartOutcome::AlreadyRunning;
        }

        if !skip_check {
            let tracked = self.state.lock().await.tracked_id();
            if let Some(instance) = self.discover(tracked).await {
                if instance.ours {
                    return StartOutcome::AlreadyRunning;
                }
                self.notifier.already_running(instance.pid);
                return StartOutcome::ForeignInstance { pid: instance.pid };
            }
        }

        let mut state = self.state.lock().await;
        if state.is_running() {
            debug!("core was started concurrently");
            return StartOutcome::AlreadyRunning;
        }
        state.reconcile();
        self.publish(&state, CorePhase::Starting);

        let core = &self.settings.core;
        let needs_tun = self.inspector.requires_elevation(&core.config_file);
        let kind = match launcher::plan_launch(
            self.settings.privileged.mode,
            needs_tun,
            &core.executable,
            self.capabilities.as_ref(),
        ) {
            Ok(kind) => kind,
            Err(e) => {
                self.publish(&state, CorePhase::Stopped);
                drop(state);
                return self.fail(e);
            }
        };
        debug!(?kind, needs_tun, "launch planned");

        if let Some(interface) = self.inspector.tun_interface(&core.config_file) {
            self.clear_tun_interface(interface).await;
        }

        let log_path = self.data_dir.core_log();
        let max_log_bytes = self.settings.log.max_bytes;
        let (handle, exit) = match kind {
            LaunchKind::Direct => {
                match launcher::spawn_direct(self.platform.as_ref(), core, &log_path, max_log_bytes)
                {
                    Ok(spawned) => (
                        ProcessHandle {
                            strategy: LaunchStrategy::Direct { pid: spawned.pid },
                            executable: core.executable.clone(),
                            config: core.config_file.clone(),
                            log: log_path,
                            started_at: Utc::now(),
                        },
                        spawned.exit,
                    ),
                    Err(e) => {
                        self.publish(&state, CorePhase::Stopped);
                        drop(state);
                        return self.fail(e);
                    }
                }
            }
            LaunchKind::Elevated => match self.spawn_elevated().await {
                Ok((pids, exit)) => (
                    ProcessHandle {
                        strategy: LaunchStrategy::Elevated {
                            pids,
                            breadcrumb: self.data_dir.breadcrumb(),
                        },
                        executable: core.executable.clone(),
                        config: core.config_file.clone(),
                        log: log_path,
                        started_at: Utc::now(),
                    },
                    exit,
                ),
                Err(e) => {
                    self.publish(&state, CorePhase::Stopped);
                    drop(state);
                    return self.fail(e);
                }
            },
        };

        let id = handle.id();
        let pid = handle.core_pid();
        info!(
            pid,
            elevated = handle.is_elevated(),
            log = %handle.log.display(),
            "core started"
        );
        state.begin(handle);
        self.publish(&state, CorePhase::Running);
        drop(state);

        self.spawn_monitor(id, exit);
        self.schedule_refresh(id);
        StartOutcome::Started { pid }
    }

    /// Elevated launch: stale breadcrumb check, trampoline, elevation
    /// prompt, then the new breadcrumb.
    async fn spawn_elevated(
        &self,
    ) -> Result<(crate::breadcrumb::ElevatedPids, crate::platform::ExitWait), StartError> {
        let crumb = self.data_dir.breadcrumb();
        match breadcrumb::read(&crumb) {
            Ok(Some(stale)) => {
                warn!(
                    wrapper = stale.wrapper,
                    child = stale.child,
                    "removing breadcrumb of an earlier elevated start"
                );
                breadcrumb::remove(&crumb);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "unreadable breadcrumb, removing");
                breadcrumb::remove(&crumb);
            }
        }

        let script = self.data_dir.trampoline();
        launcher::prepare_trampoline(
            &self.settings.core,
            &self.data_dir.core_log(),
            self.settings.log.max_bytes,
            &script,
        )?;

        info!(script = %script.display(), "requesting elevation for the core");
        let elevated = self
            .blocking(move |p| p.spawn_elevated(&script))
            .await
            .unwrap_or_else(|e| {
                Err(ElevationError::Io {
                    context: "elevation task",
                    source: std::io::Error::other(e),
                })
            })
            .map_err(|source| StartError::ElevationDenied { source })?;

        if let Err(e) = breadcrumb::write(&crumb, elevated.pids) {
            warn!(error = %e, "failed to write breadcrumb");
        }
        Ok((elevated.pids, elevated.exit))
    }

    /// Remove an interface a crashed core left behind. Never fails the start.
    async fn clear_tun_interface(&self, interface: String) {
        let name = interface.clone();
        match self.blocking(move |p| p.remove_tun_interface(&name)).await {
            Ok(Ok(true)) => info!(%interface, "removed leftover TUN interface"),
            Ok(Ok(false)) => debug!(%interface, "no leftover TUN interface"),
            Ok(Err(e)) => warn!(%interface, error = %e, "failed to remove TUN interface"),
            Err(e) => warn!(%interface, error = %e, "TUN interface cleanup task failed"),
        }
    }

    fn fail(&self, error: StartError) -> StartOutcome {
        warn!(error = %error, "core start failed");
        self.notifier.startup_error(&error);
        StartOutcome::Failed(error)
    }

    /// Discovery on the blocking pool. Fails open.
    async fn discover(&self, tracked: Option<u32>) -> Option<RunningInstance> {
        let image = self.settings.core.image_name();
        self.blocking(move |p| discovery::find_running(p, &image, tracked))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "process discovery task failed");
                None
            })
    }

    /// Run a blocking platform call off the async workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T, tokio::task::JoinError>
    where
        F: FnOnce(&dyn Platform) -> T + Send + 'static,
        T: Send + 'static,
    {
        let platform = Arc::clone(&self.platform);
        tokio::task::spawn_blocking(move || f(platform.as_ref())).await
    }

    /// Tell the UI to reload proxies once the new core had a moment to bind.
    fn schedule_refresh(self: &Arc<Self>, id: u32) {
        let inner = Arc::clone(self);
        let delay = self.settings.restart.post_start_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let current = {
                        let state = inner.state.lock().await;
                        state.is_running() && state.tracked_id() == Some(id)
                    };
                    if current {
                        debug!(id, "refreshing proxies after start");
                        inner.notifier.refresh_proxies();
                    }
                }
            }
        });
    }

    /// Write the status file and tell the notifier. Called with the lock held.
    fn publish(&self, state: &CoreState, phase: CorePhase) {
        let snapshot = state.snapshot();
        let data = StatusData {
            supervisor_pid: std::process::id(),
            phase,
            core_pid: snapshot.pid,
            privileged: snapshot.privileged,
            crash_count: snapshot.crash_count,
            max_attempts: snapshot.max_attempts,
            started_at: snapshot.started_at,
            last_update: Utc::now(),
        };
        if let Err(e) = self.status_file.write(&data) {
            debug!(error = %e, "failed to write status file");
        }
        self.notifier.status_changed(&snapshot);
    }
}

/// Drop the tracked process and its breadcrumb, if it had one.
fn release(state: &mut CoreState) {
    if let Some(handle) = state.finish() {
        if let LaunchStrategy::Elevated { breadcrumb, .. } = &handle.strategy {
            breadcrumb::remove(breadcrumb);
        }
    }
}
