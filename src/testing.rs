//! In-memory platform and notifier used by the crate's tests.

use crate::breadcrumb::ElevatedPids;
use crate::elevation::ElevationError;
use crate::launcher::StartError;
use crate::notify::Notifier;
use crate::platform::{
    ElevatedProcess, ExitOutcome, Platform, ProcessInfo, SpawnRequest, SpawnedProcess,
};
use crate::supervisor::SupervisorSnapshot;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// What the fake saw for one spawn.
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub pid: u32,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub has_log: bool,
}

#[derive(Default)]
struct FakeState {
    next_pid: u32,
    exits: HashMap<u32, oneshot::Sender<ExitOutcome>>,
    spawned: Vec<SpawnRecord>,
    spawn_attempts: usize,
    tun_removals: Vec<(String, usize)>,
    elevated: Vec<ElevatedPids>,
    interrupted: Vec<u32>,
    killed: Vec<u32>,
    terminated: Vec<ElevatedPids>,
    processes: Vec<ProcessInfo>,
    fallback_processes: Vec<ProcessInfo>,
    live_image: Option<String>,
    listing_fails: bool,
    fallback_fails: bool,
    spawn_failures: u32,
    exit_immediately: Option<ExitOutcome>,
    interrupt_fails: bool,
    exit_on_interrupt: Option<ExitOutcome>,
    deny_elevation: bool,
}

/// A [`Platform`] whose processes only exit when a test says so.
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_pid: 1000,
                ..Default::default()
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn register(state: &mut FakeState, pid: u32) -> oneshot::Receiver<ExitOutcome> {
        let (tx, rx) = oneshot::channel();
        match state.exit_immediately.clone() {
            Some(outcome) => {
                let _ = tx.send(outcome);
            }
            None => {
                state.exits.insert(pid, tx);
            }
        }
        rx
    }

    fn exit_future(rx: oneshot::Receiver<ExitOutcome>) -> crate::platform::ExitWait {
        Box::pin(async move {
            rx.await.unwrap_or(ExitOutcome::Failed {
                code: None,
                detail: "fake process dropped".to_string(),
            })
        })
    }

    /// Make the process with `pid` exit. Returns false if it is not alive.
    pub fn exit(&self, pid: u32, outcome: ExitOutcome) -> bool {
        match self.with(|s| s.exits.remove(&pid)) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn crash(&self, pid: u32) -> bool {
        self.exit(pid, crashed(1))
    }

    pub fn is_live(&self, pid: u32) -> bool {
        self.with(|s| s.exits.contains_key(&pid))
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.with(|s| s.spawned.clone())
    }

    pub fn spawn_count(&self) -> usize {
        self.with(|s| s.spawned.len())
    }

    pub fn last_pid(&self) -> Option<u32> {
        self.with(|s| s.spawned.last().map(|r| r.pid))
    }

    pub fn elevated(&self) -> Vec<ElevatedPids> {
        self.with(|s| s.elevated.clone())
    }

    pub fn interrupted(&self) -> Vec<u32> {
        self.with(|s| s.interrupted.clone())
    }

    /// Spawn calls, including the ones scripted to fail.
    pub fn spawn_attempts(&self) -> usize {
        self.with(|s| s.spawn_attempts)
    }

    /// Interfaces removed, each with the number of spawns done before it.
    pub fn tun_removals(&self) -> Vec<(String, usize)> {
        self.with(|s| s.tun_removals.clone())
    }

    pub fn killed(&self) -> Vec<u32> {
        self.with(|s| s.killed.clone())
    }

    pub fn terminated(&self) -> Vec<ElevatedPids> {
        self.with(|s| s.terminated.clone())
    }

    pub fn set_processes(&self, processes: Vec<ProcessInfo>) {
        self.with(|s| s.processes = processes);
    }

    pub fn set_fallback_processes(&self, processes: Vec<ProcessInfo>) {
        self.with(|s| s.fallback_processes = processes);
    }

    /// List every live spawned process under `image` (in both listings).
    pub fn list_live_as(&self, image: &str) {
        self.with(|s| s.live_image = Some(image.to_string()));
    }

    pub fn set_listing_fails(&self, fails: bool) {
        self.with(|s| s.listing_fails = fails);
    }

    pub fn set_fallback_fails(&self, fails: bool) {
        self.with(|s| s.fallback_fails = fails);
    }

    pub fn fail_next_spawns(&self, count: u32) {
        self.with(|s| s.spawn_failures = count);
    }

    /// Every process spawned from now on exits at once with `outcome`.
    pub fn exit_immediately(&self, outcome: Option<ExitOutcome>) {
        self.with(|s| s.exit_immediately = outcome);
    }

    pub fn set_interrupt_fails(&self, fails: bool) {
        self.with(|s| s.interrupt_fails = fails);
    }

    /// Interrupted processes exit with `outcome`.
    pub fn exit_on_interrupt(&self, outcome: Option<ExitOutcome>) {
        self.with(|s| s.exit_on_interrupt = outcome);
    }

    pub fn set_deny_elevation(&self, deny: bool) {
        self.with(|s| s.deny_elevation = deny);
    }

    fn listing(&self, fallback: bool) -> std::io::Result<Vec<ProcessInfo>> {
        self.with(|s| {
            let fails = if fallback { s.fallback_fails } else { s.listing_fails };
            if fails {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "listing unavailable",
                ));
            }
            let mut out = if fallback {
                s.fallback_processes.clone()
            } else {
                s.processes.clone()
            };
            if let Some(image) = &s.live_image {
                out.extend(s.exits.keys().map(|pid| ProcessInfo {
                    pid: *pid,
                    parent: None,
                    name: image.clone(),
                }));
            }
            Ok(out)
        })
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// A failed exit with the given code.
pub fn crashed(code: i32) -> ExitOutcome {
    ExitOutcome::Failed {
        code: Some(code),
        detail: format!("exit status: {code}"),
    }
}

impl Platform for FakePlatform {
    fn name(&self) -> &str {
        "fake"
    }

    fn spawn(&self, request: SpawnRequest) -> std::io::Result<SpawnedProcess> {
        let rx = self.with(|s| {
            s.spawn_attempts += 1;
            if s.spawn_failures > 0 {
                s.spawn_failures -= 1;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such file or directory",
                ));
            }
            let pid = s.next_pid;
            s.next_pid += 1;
            s.spawned.push(SpawnRecord {
                pid,
                program: request.program.clone(),
                args: request.args.clone(),
                working_dir: request.working_dir.clone(),
                has_log: request.log.is_some(),
            });
            Ok((pid, Self::register(s, pid)))
        })?;
        let (pid, rx) = rx;
        Ok(SpawnedProcess {
            pid,
            exit: Self::exit_future(rx),
        })
    }

    fn spawn_elevated(&self, _script: &Path) -> Result<ElevatedProcess, ElevationError> {
        let (pids, rx) = self.with(|s| {
            if s.deny_elevation {
                return Err(ElevationError::Denied {
                    detail: "user cancelled".to_string(),
                });
            }
            let pids = ElevatedPids {
                wrapper: s.next_pid,
                child: s.next_pid + 1,
            };
            s.next_pid += 2;
            s.elevated.push(pids);
            Ok((pids, Self::register(s, pids.wrapper)))
        })?;
        Ok(ElevatedProcess {
            pids,
            exit: Self::exit_future(rx),
        })
    }

    fn interrupt(&self, pid: u32) -> std::io::Result<()> {
        let (fails, exit) = self.with(|s| {
            s.interrupted.push(pid);
            (s.interrupt_fails, s.exit_on_interrupt.clone())
        });
        if fails {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "operation not permitted",
            ));
        }
        if let Some(outcome) = exit {
            self.exit(pid, outcome);
        }
        Ok(())
    }

    fn kill_tree(&self, pid: u32) -> std::io::Result<()> {
        self.with(|s| s.killed.push(pid));
        self.exit(
            pid,
            ExitOutcome::Failed {
                code: None,
                detail: "signal: 9 (SIGKILL)".to_string(),
            },
        );
        Ok(())
    }

    fn terminate_elevated(&self, pids: ElevatedPids) -> Result<(), ElevationError> {
        self.with(|s| s.terminated.push(pids));
        self.exit(
            pids.wrapper,
            ExitOutcome::Failed {
                code: None,
                detail: "signal: 15 (SIGTERM)".to_string(),
            },
        );
        Ok(())
    }

    fn remove_tun_interface(&self, name: &str) -> std::io::Result<bool> {
        self.with(|s| {
            let spawns = s.spawned.len();
            s.tun_removals.push((name.to_string(), spawns));
        });
        Ok(true)
    }

    fn list_processes(&self) -> std::io::Result<Vec<ProcessInfo>> {
        self.listing(false)
    }

    fn list_processes_fallback(&self) -> std::io::Result<Vec<ProcessInfo>> {
        self.listing(true)
    }
}

/// Everything a [`RecordingNotifier`] was told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Info(String),
    StartupError(String),
    AlreadyRunning(u32),
    CrashRestarting { attempt: u32, budget: u32 },
    CrashExhausted(u32),
    RefreshProxies,
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
    status_updates: Mutex<Vec<SupervisorSnapshot>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn status_updates(&self) -> Vec<SupervisorSnapshot> {
        self.status_updates.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Notifier for RecordingNotifier {
    fn info(&self, message: &str) {
        self.push(Event::Info(message.to_string()));
    }

    fn startup_error(&self, error: &StartError) {
        self.push(Event::StartupError(error.to_string()));
    }

    fn already_running(&self, pid: u32) {
        self.push(Event::AlreadyRunning(pid));
    }

    fn crash_restarting(&self, attempt: u32, budget: u32) {
        self.push(Event::CrashRestarting { attempt, budget });
    }

    fn crash_exhausted(&self, budget: u32) {
        self.push(Event::CrashExhausted(budget));
    }

    fn status_changed(&self, snapshot: &SupervisorSnapshot) {
        self.status_updates.lock().unwrap().push(snapshot.clone());
    }

    fn refresh_proxies(&self) {
        self.push(Event::RefreshProxies);
    }
}
