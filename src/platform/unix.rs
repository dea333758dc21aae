use super::{
    snapshot_processes, ElevatedProcess, ExitOutcome, Platform, ProcessInfo, SpawnRequest,
    SpawnedProcess,
};
use crate::breadcrumb::ElevatedPids;
use crate::discovery;
use crate::elevation::{self, ElevationError};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Linux, macOS and the BSDs.
pub struct UnixPlatform {
    elevator: Vec<String>,
}

impl UnixPlatform {
    pub fn new(elevator: Vec<String>) -> Self {
        Self { elevator }
    }
}

/// Parse `ps -A -o pid=,ppid=,comm=` output.
///
/// `comm` may be a full path on macOS; only the file name is kept.
pub(crate) fn parse_ps_output(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid: u32 = fields.next()?.parse().ok()?;
            let ppid: u32 = fields.next()?.parse().ok()?;
            let comm = fields.collect::<Vec<_>>().join(" ");
            if comm.is_empty() {
                return None;
            }
            let name = Path::new(&comm)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or(comm);
            Some(ProcessInfo {
                pid,
                parent: (ppid != 0).then_some(ppid),
                name,
            })
        })
        .collect()
}

/// A pid that names exactly one process. 0 and anything that would turn
/// negative as a `pid_t` address groups or every process, so they are refused.
fn target(pid: u32) -> std::io::Result<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        )),
    }
}

fn send(pid: u32, signal: Signal) -> std::io::Result<()> {
    kill(target(pid)?, signal).map_err(std::io::Error::from)
}

impl Platform for UnixPlatform {
    fn name(&self) -> &str {
        std::env::consts::OS
    }

    fn spawn(&self, request: SpawnRequest) -> std::io::Result<SpawnedProcess> {
        let (stdout, stderr) = match request.log {
            Some(file) => {
                let second = file.try_clone()?;
                (Stdio::from(file), Stdio::from(second))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut child = Command::new(&request.program)
            .args(&request.args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0) // Own group so the whole tree can be killed
            .spawn()?;

        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spawned process has no pid")
        })?;

        let exit = Box::pin(async move { ExitOutcome::from_wait(child.wait().await) });
        Ok(SpawnedProcess { pid, exit })
    }

    fn spawn_elevated(&self, script: &Path) -> Result<ElevatedProcess, ElevationError> {
        let (wrapper, pids) = elevation::launch(&self.elevator, script)?;
        let exit = Box::pin(async move {
            let waited = tokio::task::spawn_blocking(move || {
                let mut wrapper = wrapper;
                wrapper.wait()
            })
            .await;
            match waited {
                Ok(result) => ExitOutcome::from_wait(result),
                Err(e) => ExitOutcome::Failed {
                    code: None,
                    detail: format!("wait task failed: {e}"),
                },
            }
        });
        Ok(ElevatedProcess { pids, exit })
    }

    fn interrupt(&self, pid: u32) -> std::io::Result<()> {
        send(pid, Signal::SIGINT)
    }

    fn kill_tree(&self, pid: u32) -> std::io::Result<()> {
        let group_leader = target(pid)?;
        let processes = match self.list_processes() {
            Ok(p) => p,
            Err(_) => snapshot_processes(),
        };
        for descendant in discovery::descendants(pid, &processes) {
            let _ = send(descendant, Signal::SIGKILL);
        }

        let group = killpg(group_leader, Signal::SIGKILL);
        match send(pid, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            // Already gone is fine if the group kill landed.
            Err(e) if e.raw_os_error() == Some(Errno::ESRCH as i32) && group.is_ok() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn terminate_elevated(&self, pids: ElevatedPids) -> Result<(), ElevationError> {
        elevation::terminate(&self.elevator, pids)
    }

    fn list_processes(&self) -> std::io::Result<Vec<ProcessInfo>> {
        let output = std::process::Command::new("ps")
            .args(["-A", "-o", "pid=,ppid=,comm="])
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("ps exited with {}", output.status),
            ));
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(program: &str, args: &[&str], log: Option<std::fs::File>) -> SpawnRequest {
        SpawnRequest {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: std::env::temp_dir(),
            log,
        }
    }

    #[test]
    fn test_parse_ps_output() {
        let out = "    1     0 launchd\n  412     1 /usr/local/bin/sing-box\n  413   412 Google Chrome Helper\nbogus line\n";
        let procs = parse_ps_output(out);
        assert_eq!(procs.len(), 3);
        assert_eq!(procs[0].parent, None);
        assert_eq!(procs[1].name, "sing-box");
        assert_eq!(procs[1].parent, Some(1));
        assert_eq!(procs[2].name, "Google Chrome Helper");
    }

    #[test]
    fn test_list_processes_sees_self() {
        let platform = UnixPlatform::new(vec![]);
        let me = std::process::id();
        let procs = platform.list_processes().unwrap();
        assert!(procs.iter().any(|p| p.pid == me));
    }

    #[tokio::test]
    async fn test_spawn_writes_both_streams_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("core.log");
        let log = std::fs::File::create(&log_path).unwrap();

        let platform = UnixPlatform::new(vec![]);
        let spawned = platform
            .spawn(request(
                "sh",
                &["-c", "echo stdout-line; echo stderr-line >&2"],
                Some(log),
            ))
            .unwrap();
        assert!(spawned.pid > 0);
        assert_eq!(spawned.exit.await, ExitOutcome::Clean);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("stdout-line"));
        assert!(contents.contains("stderr-line"));
    }

    #[tokio::test]
    async fn test_spawn_nonzero_exit_is_failure() {
        let platform = UnixPlatform::new(vec![]);
        let spawned = platform.spawn(request("sh", &["-c", "exit 42"], None)).unwrap();
        match spawned.exit.await {
            ExitOutcome::Failed { code, .. } => assert_eq!(code, Some(42)),
            ExitOutcome::Clean => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let platform = UnixPlatform::new(vec![]);
        let err = platform
            .spawn(request("nonexistent-binary-xyz", &[], None))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_interrupt_stops_sleeping_process() {
        let platform = UnixPlatform::new(vec![]);
        let spawned = platform.spawn(request("sleep", &["30"], None)).unwrap();
        platform.interrupt(spawned.pid).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap();
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn test_kill_tree_kills_grandchildren() {
        let platform = UnixPlatform::new(vec![]);
        let spawned = platform
            .spawn(request("sh", &["-c", "sleep 30 & sleep 30; wait"], None))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        platform.kill_tree(spawned.pid).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap();
        assert!(!outcome.is_clean());
    }

    #[test]
    fn test_interrupt_unknown_pid_fails() {
        let platform = UnixPlatform::new(vec![]);
        // Above any pid_max on Linux or macOS.
        assert!(platform.interrupt(999_999_999).is_err());
        assert!(platform.interrupt(0).is_err());
    }

    #[test]
    fn test_pids_outside_pid_t_range_are_refused() {
        let platform = UnixPlatform::new(vec![]);
        for pid in [0, u32::MAX, i32::MAX as u32 + 1] {
            let err = platform.kill_tree(pid).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
            let err = platform.interrupt(pid).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        }
        assert_eq!(target(4242).unwrap(), Pid::from_raw(4242));
    }
}
