use super::{
    ElevatedProcess, ExitOutcome, Platform, ProcessInfo, SpawnRequest, SpawnedProcess,
};
use crate::breadcrumb::ElevatedPids;
use crate::elevation::ElevationError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

const CREATE_NO_WINDOW: u32 = 0x0800_0000;
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Windows: no elevation path, console-less spawn, CTRL_BREAK to stop and
/// `taskkill` to kill.
pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// Split one `tasklist /FO CSV` line into its fields.
pub(crate) fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse `tasklist /FO CSV /NH` output (image name, pid, ...).
pub(crate) fn parse_tasklist_output(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let fields = parse_csv_line(line);
            let name = fields.first()?.trim().to_string();
            let pid = fields.get(1)?.trim().parse().ok()?;
            Some(ProcessInfo {
                pid,
                parent: None,
                name,
            })
        })
        .collect()
}

/// Whether `netsh interface show interface name=...` output lists `name`.
pub(crate) fn interface_listed(output: &str, name: &str) -> bool {
    output.to_lowercase().contains(&name.to_lowercase())
}

fn netsh(args: &[&str]) -> std::io::Result<std::process::Output> {
    use std::os::windows::process::CommandExt;

    std::process::Command::new("netsh")
        .args(args)
        .creation_flags(CREATE_NO_WINDOW)
        .stdin(Stdio::null())
        .output()
}

fn taskkill_tree(pid: u32) -> std::io::Result<()> {
    use std::os::windows::process::CommandExt;

    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("taskkill exited with {status}"),
        ))
    }
}

/// Deliver CTRL_BREAK to the process group `pid` leads. The core is
/// spawned with `CREATE_NEW_PROCESS_GROUP`, so its pid is the group id.
fn send_ctrl_break(pid: u32) -> std::io::Result<()> {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

    if pid == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "refusing to signal process group 0",
        ));
    }
    // SAFETY: plain FFI call with integer arguments.
    let delivered = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
    if delivered == 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Platform for WindowsPlatform {
    fn name(&self) -> &str {
        "windows"
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
            .creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP)
            .spawn()?;

        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spawned process has no pid")
        })?;

        let exit = Box::pin(async move { ExitOutcome::from_wait(child.wait().await) });
        Ok(SpawnedProcess { pid, exit })
    }

    fn spawn_elevated(&self, _script: &Path) -> Result<ElevatedProcess, ElevationError> {
        Err(ElevationError::Unsupported)
    }

    fn interrupt(&self, pid: u32) -> std::io::Result<()> {
        send_ctrl_break(pid)
    }

    fn kill_tree(&self, pid: u32) -> std::io::Result<()> {
        taskkill_tree(pid)
    }

    fn terminate_elevated(&self, _pids: ElevatedPids) -> Result<(), ElevationError> {
        Err(ElevationError::Unsupported)
    }

    fn remove_tun_interface(&self, name: &str) -> std::io::Result<bool> {
        let selector = format!("name={name}");
        // A failing `show` means the interface does not exist.
        let shown = netsh(&["interface", "show", "interface", selector.as_str()])?;
        let listed = shown.status.success()
            && interface_listed(&String::from_utf8_lossy(&shown.stdout), name);
        if !listed {
            return Ok(false);
        }

        let deleted = netsh(&["interface", "delete", "interface", selector.as_str()])?;
        if deleted.status.success() {
            Ok(true)
        } else {
            Err(std::io::Error::other(format!(
                "netsh exited with {}: {}",
                deleted.status,
                String::from_utf8_lossy(&deleted.stdout).trim()
            )))
        }
    }

    fn list_processes(&self) -> std::io::Result<Vec<ProcessInfo>> {
        use std::os::windows::process::CommandExt;

        let output = std::process::Command::new("tasklist")
            .args(["/FO", "CSV", "/NH"])
            .creation_flags(CREATE_NO_WINDOW)
            .output()?;
        if !output.status.success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("tasklist exited with {}", output.status),
            ));
        }
        Ok(parse_tasklist_output(&String::from_utf8_lossy(&output.stdout)))
    }
}
